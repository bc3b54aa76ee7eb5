//! Covault: single-file Solana program implementing the vault controller of a
//! collateralized options protocol.
//!
//! One program-owned slab account holds all controller state: a header
//! (admin, pause flag), a config block (settlement oracle, pool authority
//! bump) and the vault book (per-owner vault counters, vault slots, operator
//! approvals). Batches of heterogeneous actions enter through `Operate` and
//! are applied all-or-nothing against a single target vault.

#![deny(unsafe_code)]

use solana_program::pubkey::Pubkey;

// 1. mod constants
pub mod constants {
    use crate::book::VaultBook;
    use crate::state::ControllerConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x434f5641554c5421; // "COVAULT!"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<ControllerConfig>();
    pub const BOOK_ALIGN: usize = align_of::<VaultBook>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const BOOK_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, BOOK_ALIGN);
    pub const BOOK_LEN: usize = size_of::<VaultBook>();
    pub const SLAB_LEN: usize = BOOK_OFF + BOOK_LEN;

    /// Seed of the PDA that owns the pool token accounts.
    pub const POOL_SEED: &[u8] = b"pool";

    /// All prices are e6 fixed-point.
    pub const PRICE_SCALE: u64 = 1_000_000;
}

// 2. mod zc (Zero-copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::book::VaultBook;
    use crate::constants::{BOOK_ALIGN, BOOK_LEN, BOOK_OFF};
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn book_ref<'a>(data: &'a [u8]) -> Result<&'a VaultBook, ProgramError> {
        if data.len() < BOOK_OFF + BOOK_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(BOOK_OFF) };
        if (ptr as usize) % BOOK_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const VaultBook) })
    }

    #[inline]
    pub fn book_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut VaultBook, ProgramError> {
        if data.len() < BOOK_OFF + BOOK_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(BOOK_OFF) };
        if (ptr as usize) % BOOK_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut VaultBook) })
    }

    #[inline]
    pub fn book_write(data: &mut [u8], book: VaultBook) -> Result<(), ProgramError> {
        if data.len() < BOOK_OFF + BOOK_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(BOOK_OFF) };
        if (ptr as usize) % BOOK_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        unsafe { core::ptr::write(ptr as *mut VaultBook, book) };
        Ok(())
    }
}

// 3. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, Error, FromPrimitive, PartialEq)]
    pub enum CovaultError {
        #[error("controller slab is not initialized")]
        NotInitialized,
        #[error("slab version mismatch")]
        InvalidVersion,
        #[error("controller slab is already initialized")]
        AlreadyInitialized,
        #[error("slab account has the wrong length")]
        InvalidSlabLen,
        #[error("expected account to be a signer")]
        ExpectedSigner,
        #[error("expected account to be writable")]
        ExpectedWritable,
        #[error("system is paused")]
        SystemPaused,
        #[error("sender is not the owner or an approved operator")]
        Unauthorized,
        #[error("vault id is zero, out of sequence, or does not exist")]
        InvalidVaultId,
        #[error("target vault does not exist")]
        VaultNotFound,
        #[error("batch references more than one vault")]
        MultiVaultBatch,
        #[error("amount exceeds the held balance")]
        InsufficientBalance,
        #[error("vault is under-collateralized after the batch")]
        UnderCollateralized,
        #[error("option token has not expired yet")]
        NotExpired,
        #[error("settlement price is not finalized")]
        PriceNotFinalized,
        #[error("settlement price is not set")]
        PriceNotSet,
        #[error("option token is expired")]
        OtokenExpired,
        #[error("asset does not match the vault's bound asset")]
        IncompatibleAsset,
        #[error("vault holds no option token to settle")]
        EmptyVault,
        #[error("pool token account does not match the pool authority")]
        InvalidPoolAccount,
        #[error("token account mint mismatch")]
        InvalidMint,
        #[error("oracle account data is malformed")]
        InvalidOracleData,
        #[error("option token metadata is malformed")]
        InvalidOtokenData,
        #[error("owner table is full")]
        OwnerTableFull,
        #[error("vault table is full")]
        VaultTableFull,
        #[error("operator table is full")]
        OperatorTableFull,
        #[error("arithmetic overflow")]
        Overflow,
    }

    impl From<CovaultError> for ProgramError {
        fn from(e: CovaultError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for CovaultError {
        fn type_of() -> &'static str {
            "CovaultError"
        }
    }

    impl PrintProgramError for CovaultError {
        fn print<E>(&self)
        where
            E: 'static
                + std::error::Error
                + DecodeError<E>
                + PrintProgramError
                + num_traits::FromPrimitive,
        {
            msg!(&self.to_string());
        }
    }
}

// 4. mod ix
pub mod ix {
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    /// The closed set of action kinds a batch may carry.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum ActionKind {
        OpenVault,
        MintShortOption,
        BurnShortOption,
        DepositLongOption,
        WithdrawLongOption,
        DepositCollateral,
        WithdrawCollateral,
        SettleVault,
        Exercise,
        Call,
    }

    impl ActionKind {
        pub fn from_tag(tag: u8) -> Result<Self, ProgramError> {
            Ok(match tag {
                0 => ActionKind::OpenVault,
                1 => ActionKind::MintShortOption,
                2 => ActionKind::BurnShortOption,
                3 => ActionKind::DepositLongOption,
                4 => ActionKind::WithdrawLongOption,
                5 => ActionKind::DepositCollateral,
                6 => ActionKind::WithdrawCollateral,
                7 => ActionKind::SettleVault,
                8 => ActionKind::Exercise,
                9 => ActionKind::Call,
                _ => return Err(ProgramError::InvalidInstructionData),
            })
        }

        /// Whether this kind participates in the single-vault-per-batch rule.
        /// `Exercise` acts on the sender's own long tokens and `Call` only
        /// forwards; neither targets a vault.
        pub fn carries_vault(&self) -> bool {
            !matches!(self, ActionKind::Exercise | ActionKind::Call)
        }
    }

    /// One action of an `Operate` batch. Fields are interpreted per kind;
    /// unused fields must still decode.
    #[derive(Clone, Debug)]
    pub struct Action {
        pub kind: ActionKind,
        pub owner: Pubkey,
        pub sender: Pubkey,
        pub asset: Pubkey,
        pub vault_id: u64,
        pub amount: u64,
        pub index: u64,
        pub data: Vec<u8>,
    }

    impl Action {
        pub fn decode(input: &mut &[u8]) -> Result<Self, ProgramError> {
            let kind = ActionKind::from_tag(read_u8(input)?)?;
            let owner = read_pubkey(input)?;
            let sender = read_pubkey(input)?;
            let asset = read_pubkey(input)?;
            let vault_id = read_u64(input)?;
            let amount = read_u64(input)?;
            let index = read_u64(input)?;
            let data_len = read_u16(input)? as usize;
            if input.len() < data_len {
                return Err(ProgramError::InvalidInstructionData);
            }
            let (bytes, rest) = input.split_at(data_len);
            let data = bytes.to_vec();
            *input = rest;
            Ok(Action {
                kind,
                owner,
                sender,
                asset,
                vault_id,
                amount,
                index,
                data,
            })
        }
    }

    #[derive(Debug)]
    pub enum Instruction {
        InitController { oracle: Pubkey },
        SetOperator { operator: Pubkey, approved: bool },
        SetSystemPaused { paused: bool },
        Operate { actions: Vec<Action> },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let oracle = read_pubkey(&mut rest)?;
                    Ok(Instruction::InitController { oracle })
                }
                1 => {
                    let operator = read_pubkey(&mut rest)?;
                    let approved = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetOperator { operator, approved })
                }
                2 => {
                    let paused = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetSystemPaused { paused })
                }
                3 => {
                    let count = read_u8(&mut rest)? as usize;
                    let mut actions = Vec::with_capacity(count);
                    for _ in 0..count {
                        actions.push(Action::decode(&mut rest)?);
                    }
                    Ok(Instruction::Operate { actions })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input
            .split_first()
            .ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(bytes.try_into().unwrap()))
    }
}

// 5. mod accounts (account shape validation)
pub mod accounts {
    use crate::constants::POOL_SEED;
    use crate::error::CovaultError;
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError, program_pack::Pack,
        pubkey::Pubkey,
    };

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(CovaultError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(CovaultError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_pool_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[POOL_SEED, slab_key.as_ref()], program_id)
    }

    /// A pool token account must be an SPL token account of the expected
    /// mint, owned by the pool authority PDA.
    pub fn verify_pool_account(
        ai: &AccountInfo,
        pool_authority: &Pubkey,
        expected_mint: &Pubkey,
    ) -> Result<(), ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(CovaultError::InvalidPoolAccount.into());
        }
        if ai.data_len() != spl_token::state::Account::LEN {
            return Err(CovaultError::InvalidPoolAccount.into());
        }
        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(CovaultError::InvalidMint.into());
        }
        if tok.owner != *pool_authority {
            return Err(CovaultError::InvalidPoolAccount.into());
        }
        Ok(())
    }
}

// 6. mod state (header + config)
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        /// Non-zero gates every state-mutating entry point.
        pub paused: u8,
        pub _padding: [u8; 2],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct ControllerConfig {
        /// The settlement oracle account this controller trusts.
        pub oracle: [u8; 32],
        pub pool_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> ControllerConfig {
        let mut c = ControllerConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &ControllerConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod book (the vault store)
pub mod book {
    use crate::error::CovaultError;
    use bytemuck::{Pod, Zeroable};

    pub const MAX_OWNERS: usize = 32;
    pub const MAX_VAULTS: usize = 64;
    pub const MAX_OPERATORS: usize = 64;

    pub const NO_ASSET: [u8; 32] = [0u8; 32];

    /// Per-owner vault counter. The counter is the sole source of truth for
    /// existence: vault id N exists iff 1 <= N <= vault_count.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
    pub struct OwnerEntry {
        pub owner: [u8; 32],
        pub vault_count: u64,
    }

    /// One vault. Ids are dense per owner, assigned by the counter, never
    /// reused and never zero. Slots persist after settlement with zeroed
    /// balances; a balance of zero always has its asset key cleared.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
    pub struct VaultSlot {
        pub owner: [u8; 32],
        pub short_otoken: [u8; 32],
        pub long_otoken: [u8; 32],
        pub collateral_asset: [u8; 32],
        pub vault_id: u64,
        pub short_amount: u64,
        pub long_amount: u64,
        pub collateral_amount: u64,
        pub in_use: u8,
        pub _padding: [u8; 7],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
    pub struct OperatorSlot {
        pub owner: [u8; 32],
        pub operator: [u8; 32],
        pub approved: u8,
        pub _padding: [u8; 7],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
    pub struct VaultBook {
        pub owners: [OwnerEntry; MAX_OWNERS],
        pub vaults: [VaultSlot; MAX_VAULTS],
        pub operators: [OperatorSlot; MAX_OPERATORS],
    }

    impl VaultBook {
        pub fn owner_entry(&self, owner: &[u8; 32]) -> Option<&OwnerEntry> {
            self.owners.iter().find(|e| e.owner == *owner)
        }

        pub fn vault_count(&self, owner: &[u8; 32]) -> u64 {
            self.owner_entry(owner).map(|e| e.vault_count).unwrap_or(0)
        }

        pub fn has_free_owner_slot(&self) -> bool {
            self.owners
                .iter()
                .any(|e| e.owner == NO_ASSET && e.vault_count == 0)
        }

        pub fn free_vault_slot(&self) -> Option<usize> {
            self.vaults.iter().position(|v| v.in_use == 0)
        }

        pub fn owner_entry_mut(
            &mut self,
            owner: &[u8; 32],
        ) -> Result<&mut OwnerEntry, CovaultError> {
            let pos = self.owners.iter().position(|e| e.owner == *owner);
            let idx = match pos {
                Some(idx) => idx,
                None => {
                    let free = self
                        .owners
                        .iter()
                        .position(|e| e.owner == NO_ASSET && e.vault_count == 0)
                        .ok_or(CovaultError::OwnerTableFull)?;
                    self.owners[free].owner = *owner;
                    free
                }
            };
            Ok(&mut self.owners[idx])
        }

        /// Materializes the next vault for `owner`. The id must be exactly
        /// the counter plus one.
        pub fn open_vault(
            &mut self,
            owner: &[u8; 32],
            vault_id: u64,
        ) -> Result<usize, CovaultError> {
            let count = self.vault_count(owner);
            if vault_id == 0 || vault_id != count + 1 {
                return Err(CovaultError::InvalidVaultId);
            }
            let slot_idx = self
                .free_vault_slot()
                .ok_or(CovaultError::VaultTableFull)?;
            self.owner_entry_mut(owner)?.vault_count = vault_id;
            let slot = &mut self.vaults[slot_idx];
            *slot = VaultSlot::zeroed();
            slot.owner = *owner;
            slot.vault_id = vault_id;
            slot.in_use = 1;
            Ok(slot_idx)
        }

        pub fn vault_index(&self, owner: &[u8; 32], vault_id: u64) -> Result<usize, CovaultError> {
            if vault_id == 0 || vault_id > self.vault_count(owner) {
                return Err(CovaultError::InvalidVaultId);
            }
            self.vaults
                .iter()
                .position(|v| v.in_use != 0 && v.owner == *owner && v.vault_id == vault_id)
                .ok_or(CovaultError::InvalidVaultId)
        }

        pub fn vault(&self, owner: &[u8; 32], vault_id: u64) -> Result<&VaultSlot, CovaultError> {
            let idx = self.vault_index(owner, vault_id)?;
            Ok(&self.vaults[idx])
        }

        pub fn vault_mut(
            &mut self,
            owner: &[u8; 32],
            vault_id: u64,
        ) -> Result<&mut VaultSlot, CovaultError> {
            let idx = self.vault_index(owner, vault_id)?;
            Ok(&mut self.vaults[idx])
        }

        pub fn set_operator(
            &mut self,
            owner: &[u8; 32],
            operator: &[u8; 32],
            approved: bool,
        ) -> Result<(), CovaultError> {
            let pos = self
                .operators
                .iter()
                .position(|s| s.owner == *owner && s.operator == *operator);
            let idx = match pos {
                Some(idx) => idx,
                None => {
                    let free = self
                        .operators
                        .iter()
                        .position(|s| s.owner == NO_ASSET && s.operator == NO_ASSET)
                        .ok_or(CovaultError::OperatorTableFull)?;
                    self.operators[free].owner = *owner;
                    self.operators[free].operator = *operator;
                    free
                }
            };
            self.operators[idx].approved = approved as u8;
            Ok(())
        }

        pub fn is_operator(&self, owner: &[u8; 32], operator: &[u8; 32]) -> bool {
            self.operators
                .iter()
                .any(|s| s.owner == *owner && s.operator == *operator && s.approved != 0)
        }
    }

    impl VaultSlot {
        pub fn add_short(&mut self, otoken: &[u8; 32], amount: u64) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.short_amount > 0 && self.short_otoken != *otoken {
                return Err(CovaultError::IncompatibleAsset);
            }
            let new_amount = self
                .short_amount
                .checked_add(amount)
                .ok_or(CovaultError::Overflow)?;
            self.short_otoken = *otoken;
            self.short_amount = new_amount;
            Ok(())
        }

        pub fn remove_short(&mut self, otoken: &[u8; 32], amount: u64) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.short_otoken != *otoken {
                return Err(CovaultError::IncompatibleAsset);
            }
            self.short_amount = self
                .short_amount
                .checked_sub(amount)
                .ok_or(CovaultError::InsufficientBalance)?;
            if self.short_amount == 0 {
                self.short_otoken = NO_ASSET;
            }
            Ok(())
        }

        pub fn add_long(&mut self, otoken: &[u8; 32], amount: u64) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.long_amount > 0 && self.long_otoken != *otoken {
                return Err(CovaultError::IncompatibleAsset);
            }
            let new_amount = self
                .long_amount
                .checked_add(amount)
                .ok_or(CovaultError::Overflow)?;
            self.long_otoken = *otoken;
            self.long_amount = new_amount;
            Ok(())
        }

        pub fn remove_long(&mut self, otoken: &[u8; 32], amount: u64) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.long_otoken != *otoken {
                return Err(CovaultError::IncompatibleAsset);
            }
            self.long_amount = self
                .long_amount
                .checked_sub(amount)
                .ok_or(CovaultError::InsufficientBalance)?;
            if self.long_amount == 0 {
                self.long_otoken = NO_ASSET;
            }
            Ok(())
        }

        pub fn add_collateral(&mut self, asset: &[u8; 32], amount: u64) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.collateral_amount > 0 && self.collateral_asset != *asset {
                return Err(CovaultError::IncompatibleAsset);
            }
            let new_amount = self
                .collateral_amount
                .checked_add(amount)
                .ok_or(CovaultError::Overflow)?;
            self.collateral_asset = *asset;
            self.collateral_amount = new_amount;
            Ok(())
        }

        pub fn remove_collateral(
            &mut self,
            asset: &[u8; 32],
            amount: u64,
        ) -> Result<(), CovaultError> {
            if amount == 0 {
                return Ok(());
            }
            if self.collateral_asset != *asset {
                return Err(CovaultError::IncompatibleAsset);
            }
            self.collateral_amount = self
                .collateral_amount
                .checked_sub(amount)
                .ok_or(CovaultError::InsufficientBalance)?;
            if self.collateral_amount == 0 {
                self.collateral_asset = NO_ASSET;
            }
            Ok(())
        }

        /// Settlement leaves the slot in place with nothing economically
        /// relevant left in it.
        pub fn clear_balances(&mut self) {
            self.short_otoken = NO_ASSET;
            self.long_otoken = NO_ASSET;
            self.collateral_asset = NO_ASSET;
            self.short_amount = 0;
            self.long_amount = 0;
            self.collateral_amount = 0;
        }
    }
}

// 8. mod margin (collateral-sufficiency seam)
pub mod margin {
    use crate::book::VaultSlot;
    use crate::constants::PRICE_SCALE;
    use crate::error::CovaultError;
    use crate::otoken::OtokenMeta;

    /// Pluggable collateral-sufficiency and payout calculator. The
    /// dispatcher only ever sees this trait.
    pub trait MarginEngine {
        fn is_vault_valid(&self, vault: &VaultSlot) -> Result<bool, CovaultError>;
        fn excess_collateral(&self, vault: &VaultSlot) -> Result<u64, CovaultError>;
        fn expired_payout(
            &self,
            vault: &VaultSlot,
            meta: &OtokenMeta,
            settlement_price_e6: u64,
        ) -> Result<u64, CovaultError>;
        fn exercise_payout(
            &self,
            meta: &OtokenMeta,
            settlement_price_e6: u64,
            amount: u64,
        ) -> Result<u64, CovaultError>;
    }

    /// Intrinsic value of one option at settlement, e6.
    pub fn intrinsic_e6(meta: &OtokenMeta, settlement_price_e6: u64) -> u64 {
        if meta.is_put {
            meta.strike_price_e6.saturating_sub(settlement_price_e6)
        } else {
            settlement_price_e6.saturating_sub(meta.strike_price_e6)
        }
    }

    /// Cash value of `amount` options at the given intrinsic, in collateral
    /// base units.
    pub fn cash_value(amount: u64, intrinsic_e6: u64) -> Result<u64, CovaultError> {
        let v = (amount as u128)
            .checked_mul(intrinsic_e6 as u128)
            .ok_or(CovaultError::Overflow)?
            / PRICE_SCALE as u128;
        u64::try_from(v).map_err(|_| CovaultError::Overflow)
    }

    /// Fully-collateralized cash margin: one unit of collateral per net
    /// short option. Settlement nets the vault's long claim against its
    /// short obligation at intrinsic value.
    pub struct VanillaMargin;

    impl MarginEngine for VanillaMargin {
        fn is_vault_valid(&self, vault: &VaultSlot) -> Result<bool, CovaultError> {
            let net_short = vault.short_amount.saturating_sub(vault.long_amount);
            Ok(vault.collateral_amount >= net_short)
        }

        fn excess_collateral(&self, vault: &VaultSlot) -> Result<u64, CovaultError> {
            let net_short = vault.short_amount.saturating_sub(vault.long_amount);
            vault
                .collateral_amount
                .checked_sub(net_short)
                .ok_or(CovaultError::UnderCollateralized)
        }

        fn expired_payout(
            &self,
            vault: &VaultSlot,
            meta: &OtokenMeta,
            settlement_price_e6: u64,
        ) -> Result<u64, CovaultError> {
            let intrinsic = intrinsic_e6(meta, settlement_price_e6);
            let short_obligation = cash_value(vault.short_amount, intrinsic)?;
            let long_claim = cash_value(vault.long_amount, intrinsic)?;
            let total = vault.collateral_amount as u128 + long_claim as u128;
            let payout = total.saturating_sub(short_obligation as u128);
            u64::try_from(payout).map_err(|_| CovaultError::Overflow)
        }

        fn exercise_payout(
            &self,
            meta: &OtokenMeta,
            settlement_price_e6: u64,
            amount: u64,
        ) -> Result<u64, CovaultError> {
            cash_value(amount, intrinsic_e6(meta, settlement_price_e6))
        }
    }
}

// 9. mod oracle (settlement oracle reader / finality gate)
pub mod oracle {
    use crate::error::CovaultError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub const ORACLE_MAGIC: u64 = 0x434f564f5241434c; // "COVORACL"
    pub const ORACLE_HEADER_LEN: usize = 10;
    pub const ORACLE_RECORD_LEN: usize = 50;

    /// One oracle-reported fact for an (asset, expiry) pair. `finalized` is
    /// the oracle's own assertion that the dispute window has cleared; it is
    /// never recomputed here from timestamps.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ExpiryPrice {
        pub price_e6: u64,
        pub is_set: bool,
        pub finalized: bool,
    }

    fn find_record(
        data: &[u8],
        asset: &Pubkey,
        expiry: u64,
    ) -> Result<Option<ExpiryPrice>, ProgramError> {
        if data.len() < ORACLE_HEADER_LEN {
            return Err(CovaultError::InvalidOracleData.into());
        }
        let magic = u64::from_le_bytes(*array_ref![data, 0, 8]);
        if magic != ORACLE_MAGIC {
            return Err(CovaultError::InvalidOracleData.into());
        }
        let count = u16::from_le_bytes(*array_ref![data, 8, 2]) as usize;
        if data.len() < ORACLE_HEADER_LEN + count * ORACLE_RECORD_LEN {
            return Err(CovaultError::InvalidOracleData.into());
        }
        let asset_bytes = asset.to_bytes();
        for i in 0..count {
            let off = ORACLE_HEADER_LEN + i * ORACLE_RECORD_LEN;
            let rec_asset = array_ref![data, off, 32];
            let rec_expiry = u64::from_le_bytes(*array_ref![data, off + 32, 8]);
            if *rec_asset == asset_bytes && rec_expiry == expiry {
                let price_e6 = u64::from_le_bytes(*array_ref![data, off + 40, 8]);
                let is_set = data[off + 48] != 0;
                let finalized = data[off + 49] != 0;
                return Ok(Some(ExpiryPrice {
                    price_e6,
                    is_set,
                    finalized,
                }));
            }
        }
        Ok(None)
    }

    pub fn read_expiry_price(
        oracle_ai: &AccountInfo,
        asset: &Pubkey,
        expiry: u64,
    ) -> Result<(u64, bool), ProgramError> {
        let data = oracle_ai.try_borrow_data()?;
        match find_record(&data, asset, expiry)? {
            Some(rec) => Ok((rec.price_e6, rec.is_set)),
            None => Ok((0, false)),
        }
    }

    /// True iff the oracle has explicitly marked (asset, expiry) finalized.
    pub fn is_price_finalized(
        oracle_ai: &AccountInfo,
        asset: &Pubkey,
        expiry: u64,
    ) -> Result<bool, ProgramError> {
        let data = oracle_ai.try_borrow_data()?;
        Ok(find_record(&data, asset, expiry)?
            .map(|rec| rec.finalized)
            .unwrap_or(false))
    }
}

// 10. mod otoken (option token collaborator boundary)
pub mod otoken {
    use crate::error::CovaultError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    pub const OTOKEN_MAGIC: u64 = 0x434f564f544f4b4e; // "COVOTOKN"
    pub const OTOKEN_META_LEN: usize = 153;

    /// Read-only option-series metadata published by the option token
    /// program alongside the SPL mint.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OtokenMeta {
        pub mint: Pubkey,
        pub underlying_asset: Pubkey,
        pub strike_asset: Pubkey,
        pub collateral_asset: Pubkey,
        pub strike_price_e6: u64,
        pub expiry: u64,
        pub is_put: bool,
    }

    pub fn read_meta(ai: &AccountInfo) -> Result<OtokenMeta, ProgramError> {
        let data = ai.try_borrow_data()?;
        if data.len() < OTOKEN_META_LEN {
            return Err(CovaultError::InvalidOtokenData.into());
        }
        let magic = u64::from_le_bytes(*array_ref![data, 0, 8]);
        if magic != OTOKEN_MAGIC {
            return Err(CovaultError::InvalidOtokenData.into());
        }
        Ok(OtokenMeta {
            mint: Pubkey::new_from_array(*array_ref![data, 8, 32]),
            underlying_asset: Pubkey::new_from_array(*array_ref![data, 40, 32]),
            strike_asset: Pubkey::new_from_array(*array_ref![data, 72, 32]),
            collateral_asset: Pubkey::new_from_array(*array_ref![data, 104, 32]),
            strike_price_e6: u64::from_le_bytes(*array_ref![data, 136, 8]),
            expiry: u64::from_le_bytes(*array_ref![data, 144, 8]),
            is_put: data[152] != 0,
        })
    }

    pub fn is_expired(meta: &OtokenMeta, now: u64) -> bool {
        now >= meta.expiry
    }

    pub fn mint_to<'a>(
        _token_program: &AccountInfo<'a>,
        _mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::mint_to(
                _token_program.key,
                _mint.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    _mint.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn burn<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        _mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(
                _token_program.key,
                source.key,
                _mint.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    _mint.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;
            Ok(())
        }
    }
}

// 11. mod collateral (asset transfer collaborator boundary)
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    /// Moves tokens from a user account into a pool account; the sender's
    /// outer signature authorizes the debit.
    pub fn pull<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    /// Moves tokens out of a pool account; the pool authority PDA signs.
    pub fn release<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }
}

// 12. mod processor
pub mod processor {
    use crate::{
        accounts,
        book::{VaultSlot, NO_ASSET},
        collateral,
        constants::{MAGIC, POOL_SEED, SLAB_LEN, VERSION},
        error::CovaultError,
        ix::{Action, ActionKind, Instruction},
        margin::{MarginEngine, VanillaMargin},
        oracle, otoken,
        state::{self, ControllerConfig, SlabHeader},
        zc,
    };
    use bytemuck::Zeroable;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        program_error::ProgramError,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    #[cfg(not(test))]
    use solana_program::{
        instruction::{AccountMeta, Instruction as SolInstruction},
        program::invoke,
    };

    /// `Operate` account layout: sender, slab, clock, token program, pool
    /// authority, then one documented window of tail accounts per action.
    pub const OPERATE_FIXED_ACCOUNTS: usize = 5;

    fn slab_guard(
        program_id: &Pubkey,
        slab: &AccountInfo,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(CovaultError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(CovaultError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(CovaultError::InvalidVersion.into());
        }
        Ok(())
    }

    /// The batch's working copy of its single target vault. All action
    /// mutations land here; the book is only written on full success.
    struct Scratch {
        owner: Pubkey,
        count: u64,
        slot: VaultSlot,
        slot_idx: usize,
        exists: bool,
    }

    /// A token movement decided during dispatch, executed only after the
    /// whole batch has validated. Indices point into the accounts slice.
    enum TokenOp {
        Pull { source: usize, dest: usize, amount: u64 },
        Release { source: usize, dest: usize, amount: u64 },
        MintOtoken { mint: usize, dest: usize, amount: u64 },
        BurnOtoken { mint: usize, source: usize, amount: u64 },
    }

    pub fn process_instruction(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitController { oracle } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(CovaultError::AlreadyInitialized.into());
                }

                let (_, bump) = accounts::derive_pool_authority(program_id, a_slab.key);

                for b in data.iter_mut() {
                    *b = 0;
                }

                let config = ControllerConfig {
                    oracle: oracle.to_bytes(),
                    pool_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    paused: 0,
                    _padding: [0; 2],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
                Ok(())
            }
            Instruction::SetOperator { operator, approved } => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let header = state::read_header(&data);
                if header.paused != 0 {
                    return Err(CovaultError::SystemPaused.into());
                }

                let book = zc::book_mut(&mut data)?;
                book.set_operator(&a_owner.key.to_bytes(), &operator.to_bytes(), approved)?;
                Ok(())
            }
            Instruction::SetSystemPaused { paused } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let mut header = state::read_header(&data);
                if header.admin != a_admin.key.to_bytes() {
                    return Err(CovaultError::Unauthorized.into());
                }
                header.paused = paused as u8;
                state::write_header(&mut data, &header);
                Ok(())
            }
            Instruction::Operate { actions } => process_operate(program_id, accounts, &actions),
        }
    }

    fn process_operate(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        actions: &[Action],
    ) -> ProgramResult {
        accounts::expect_len(accounts, OPERATE_FIXED_ACCOUNTS)?;
        let a_sender = &accounts[0];
        let a_slab = &accounts[1];
        let a_clock = &accounts[2];
        let a_token = &accounts[3];
        let a_pool_auth = &accounts[4];

        accounts::expect_signer(a_sender)?;
        accounts::expect_writable(a_slab)?;

        let mut data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;

        let header = state::read_header(&data);
        if header.paused != 0 {
            return Err(CovaultError::SystemPaused.into());
        }
        let config = state::read_config(&data);
        let oracle_key = Pubkey::new_from_array(config.oracle);

        let (pool_authority, _) = accounts::derive_pool_authority(program_id, a_slab.key);
        accounts::expect_key(a_pool_auth, &pool_authority)?;

        let clock = Clock::from_account_info(a_clock)?;
        let now = clock.unix_timestamp.max(0) as u64;

        // Every action is authorized before anything is touched.
        {
            let book = zc::book_ref(&data)?;
            for action in actions {
                if action.sender != *a_sender.key {
                    return Err(CovaultError::Unauthorized.into());
                }
                if action.sender != action.owner
                    && !book.is_operator(&action.owner.to_bytes(), &action.sender.to_bytes())
                {
                    return Err(CovaultError::Unauthorized.into());
                }
            }
        }

        // The batch targets at most one vault; the first vault-carrying
        // action fixes it.
        let mut target: Option<(Pubkey, u64)> = None;
        let mut opens_vault = false;
        for action in actions {
            if !action.kind.carries_vault() {
                continue;
            }
            match target {
                None => {
                    target = Some((action.owner, action.vault_id));
                    opens_vault = action.kind == ActionKind::OpenVault;
                }
                Some((owner, vault_id)) => {
                    if owner != action.owner || vault_id != action.vault_id {
                        return Err(CovaultError::MultiVaultBatch.into());
                    }
                }
            }
        }

        let mut scratch: Option<Scratch> = None;
        if let Some((owner, vault_id)) = target {
            let book = zc::book_ref(&data)?;
            let owner_bytes = owner.to_bytes();
            let count = book.vault_count(&owner_bytes);
            if opens_vault {
                // Table capacity is checked up front so the commit below
                // cannot fail after token movements have executed.
                if book.owner_entry(&owner_bytes).is_none() && !book.has_free_owner_slot() {
                    return Err(CovaultError::OwnerTableFull.into());
                }
                let slot_idx = book
                    .free_vault_slot()
                    .ok_or(CovaultError::VaultTableFull)?;
                scratch = Some(Scratch {
                    owner,
                    count,
                    slot: VaultSlot::zeroed(),
                    slot_idx,
                    exists: false,
                });
            } else {
                if vault_id == 0 || vault_id > count {
                    return Err(CovaultError::VaultNotFound.into());
                }
                let slot_idx = book.vault_index(&owner_bytes, vault_id)?;
                scratch = Some(Scratch {
                    owner,
                    count,
                    slot: book.vaults[slot_idx],
                    slot_idx,
                    exists: true,
                });
            }
        }

        let mut cursor = OPERATE_FIXED_ACCOUNTS;
        let mut pending: Vec<TokenOp> = Vec::new();
        let mut risk_increased = false;

        for action in actions {
            match action.kind {
                ActionKind::OpenVault => {
                    let s = scratch
                        .as_mut()
                        .ok_or::<ProgramError>(CovaultError::VaultNotFound.into())?;
                    if action.vault_id == 0 || action.vault_id != s.count + 1 {
                        return Err(CovaultError::InvalidVaultId.into());
                    }
                    s.count = action.vault_id;
                    s.slot = VaultSlot::zeroed();
                    s.slot.owner = action.owner.to_bytes();
                    s.slot.vault_id = action.vault_id;
                    s.slot.in_use = 1;
                    s.exists = true;
                }
                ActionKind::MintShortOption => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 3)?;
                    let i_meta = cursor;
                    let i_mint = cursor + 1;
                    let i_dest = cursor + 2;
                    cursor += 3;

                    accounts::expect_key(&accounts[i_meta], &action.asset)?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;
                    if otoken::is_expired(&meta, now) {
                        return Err(CovaultError::OtokenExpired.into());
                    }
                    accounts::expect_key(&accounts[i_mint], &meta.mint)?;

                    s.slot.add_short(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::MintOtoken {
                            mint: i_mint,
                            dest: i_dest,
                            amount: action.amount,
                        });
                    }
                    risk_increased = true;
                }
                ActionKind::BurnShortOption => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 3)?;
                    let i_meta = cursor;
                    let i_mint = cursor + 1;
                    let i_source = cursor + 2;
                    cursor += 3;

                    accounts::expect_key(&accounts[i_meta], &action.asset)?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;
                    accounts::expect_key(&accounts[i_mint], &meta.mint)?;

                    s.slot.remove_short(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::BurnOtoken {
                            mint: i_mint,
                            source: i_source,
                            amount: action.amount,
                        });
                    }
                }
                ActionKind::DepositLongOption => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 3)?;
                    let i_meta = cursor;
                    let i_source = cursor + 1;
                    let i_pool = cursor + 2;
                    cursor += 3;

                    accounts::expect_key(&accounts[i_meta], &action.asset)?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;
                    if otoken::is_expired(&meta, now) {
                        return Err(CovaultError::OtokenExpired.into());
                    }
                    accounts::verify_pool_account(&accounts[i_pool], &pool_authority, &meta.mint)?;

                    s.slot.add_long(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::Pull {
                            source: i_source,
                            dest: i_pool,
                            amount: action.amount,
                        });
                    }
                }
                ActionKind::WithdrawLongOption => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 3)?;
                    let i_meta = cursor;
                    let i_pool = cursor + 1;
                    let i_dest = cursor + 2;
                    cursor += 3;

                    accounts::expect_key(&accounts[i_meta], &action.asset)?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;
                    accounts::verify_pool_account(&accounts[i_pool], &pool_authority, &meta.mint)?;

                    s.slot.remove_long(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::Release {
                            source: i_pool,
                            dest: i_dest,
                            amount: action.amount,
                        });
                    }
                    risk_increased = true;
                }
                ActionKind::DepositCollateral => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 2)?;
                    let i_source = cursor;
                    let i_pool = cursor + 1;
                    cursor += 2;

                    accounts::verify_pool_account(
                        &accounts[i_pool],
                        &pool_authority,
                        &action.asset,
                    )?;

                    s.slot.add_collateral(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::Pull {
                            source: i_source,
                            dest: i_pool,
                            amount: action.amount,
                        });
                    }
                }
                ActionKind::WithdrawCollateral => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 2)?;
                    let i_pool = cursor;
                    let i_dest = cursor + 1;
                    cursor += 2;

                    accounts::verify_pool_account(
                        &accounts[i_pool],
                        &pool_authority,
                        &action.asset,
                    )?;

                    s.slot
                        .remove_collateral(&action.asset.to_bytes(), action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::Release {
                            source: i_pool,
                            dest: i_dest,
                            amount: action.amount,
                        });
                    }
                    risk_increased = true;
                }
                ActionKind::SettleVault => {
                    let s = vault_scratch(&mut scratch)?;
                    accounts::expect_len(accounts, cursor + 4)?;
                    let i_meta = cursor;
                    let i_oracle = cursor + 1;
                    let i_pool = cursor + 2;
                    let i_dest = cursor + 3;
                    cursor += 4;

                    let otoken_key = if s.slot.short_otoken != NO_ASSET {
                        s.slot.short_otoken
                    } else if s.slot.long_otoken != NO_ASSET {
                        s.slot.long_otoken
                    } else {
                        return Err(CovaultError::EmptyVault.into());
                    };
                    accounts::expect_key(&accounts[i_meta], &Pubkey::new_from_array(otoken_key))?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;

                    if !otoken::is_expired(&meta, now) {
                        return Err(CovaultError::NotExpired.into());
                    }
                    accounts::expect_key(&accounts[i_oracle], &oracle_key)?;
                    if !oracle::is_price_finalized(
                        &accounts[i_oracle],
                        &meta.underlying_asset,
                        meta.expiry,
                    )? {
                        return Err(CovaultError::PriceNotFinalized.into());
                    }
                    let (price, is_set) = oracle::read_expiry_price(
                        &accounts[i_oracle],
                        &meta.underlying_asset,
                        meta.expiry,
                    )?;
                    if !is_set {
                        return Err(CovaultError::PriceNotSet.into());
                    }

                    accounts::verify_pool_account(
                        &accounts[i_pool],
                        &pool_authority,
                        &meta.collateral_asset,
                    )?;

                    let payout = VanillaMargin.expired_payout(&s.slot, &meta, price)?;
                    s.slot.clear_balances();
                    if payout > 0 {
                        pending.push(TokenOp::Release {
                            source: i_pool,
                            dest: i_dest,
                            amount: payout,
                        });
                    }
                }
                ActionKind::Exercise => {
                    accounts::expect_len(accounts, cursor + 6)?;
                    let i_meta = cursor;
                    let i_mint = cursor + 1;
                    let i_source = cursor + 2;
                    let i_oracle = cursor + 3;
                    let i_pool = cursor + 4;
                    let i_dest = cursor + 5;
                    cursor += 6;

                    accounts::expect_key(&accounts[i_meta], &action.asset)?;
                    let meta = otoken::read_meta(&accounts[i_meta])?;
                    if !otoken::is_expired(&meta, now) {
                        return Err(CovaultError::NotExpired.into());
                    }
                    accounts::expect_key(&accounts[i_oracle], &oracle_key)?;
                    if !oracle::is_price_finalized(
                        &accounts[i_oracle],
                        &meta.underlying_asset,
                        meta.expiry,
                    )? {
                        return Err(CovaultError::PriceNotFinalized.into());
                    }
                    let (price, is_set) = oracle::read_expiry_price(
                        &accounts[i_oracle],
                        &meta.underlying_asset,
                        meta.expiry,
                    )?;
                    if !is_set {
                        return Err(CovaultError::PriceNotSet.into());
                    }
                    accounts::expect_key(&accounts[i_mint], &meta.mint)?;
                    accounts::verify_pool_account(
                        &accounts[i_pool],
                        &pool_authority,
                        &meta.collateral_asset,
                    )?;

                    let payout = VanillaMargin.exercise_payout(&meta, price, action.amount)?;
                    if action.amount > 0 {
                        pending.push(TokenOp::BurnOtoken {
                            mint: i_mint,
                            source: i_source,
                            amount: action.amount,
                        });
                    }
                    if payout > 0 {
                        pending.push(TokenOp::Release {
                            source: i_pool,
                            dest: i_dest,
                            amount: payout,
                        });
                    }
                }
                ActionKind::Call => {
                    accounts::expect_len(accounts, cursor + 2)?;
                    #[cfg(not(test))]
                    {
                        let a_callee = &accounts[cursor];
                        let a_target = &accounts[cursor + 1];
                        let meta = if a_target.is_writable {
                            AccountMeta::new(*a_target.key, a_target.is_signer)
                        } else {
                            AccountMeta::new_readonly(*a_target.key, a_target.is_signer)
                        };
                        let ixn = SolInstruction {
                            program_id: *a_callee.key,
                            accounts: vec![meta],
                            data: action.data.clone(),
                        };
                        invoke(&ixn, &[a_target.clone()])?;
                    }
                    cursor += 2;
                }
            }
        }

        // Post-condition: any risk-increasing action subjects the final
        // vault state to the margin check.
        if risk_increased {
            if let Some(s) = scratch.as_ref() {
                if !VanillaMargin.is_vault_valid(&s.slot)? {
                    return Err(CovaultError::UnderCollateralized.into());
                }
            }
        }

        // All checks passed: move tokens, then commit the book.
        let bump_arr: [u8; 1] = [config.pool_authority_bump];
        let seed1: &[u8] = POOL_SEED;
        let seed2: &[u8] = a_slab.key.as_ref();
        let seed3: &[u8] = &bump_arr;
        let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
        let signer_seeds: [&[&[u8]]; 1] = [&seeds];

        for op in &pending {
            match *op {
                TokenOp::Pull {
                    source,
                    dest,
                    amount,
                } => collateral::pull(a_token, &accounts[source], &accounts[dest], a_sender, amount)?,
                TokenOp::Release {
                    source,
                    dest,
                    amount,
                } => collateral::release(
                    a_token,
                    &accounts[source],
                    &accounts[dest],
                    a_pool_auth,
                    amount,
                    &signer_seeds,
                )?,
                TokenOp::MintOtoken { mint, dest, amount } => otoken::mint_to(
                    a_token,
                    &accounts[mint],
                    &accounts[dest],
                    a_pool_auth,
                    amount,
                    &signer_seeds,
                )?,
                TokenOp::BurnOtoken {
                    mint,
                    source,
                    amount,
                } => otoken::burn(a_token, &accounts[source], &accounts[mint], a_sender, amount)?,
            }
        }

        if let Some(s) = scratch {
            if s.exists {
                let book = zc::book_mut(&mut data)?;
                book.vaults[s.slot_idx] = s.slot;
                book.owner_entry_mut(&s.owner.to_bytes())?.vault_count = s.count;
            }
        }

        Ok(())
    }

    fn vault_scratch(scratch: &mut Option<Scratch>) -> Result<&mut Scratch, ProgramError> {
        match scratch {
            Some(s) if s.exists => Ok(s),
            _ => Err(CovaultError::VaultNotFound.into()),
        }
    }
}

// 13. mod query (read-only projections)
pub mod query {
    use crate::book::VaultSlot;
    use crate::constants::{MAGIC, SLAB_LEN, VERSION};
    use crate::error::CovaultError;
    use crate::{state, zc};
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    fn checked_slab(data: &[u8]) -> Result<(), ProgramError> {
        if data.len() != SLAB_LEN {
            return Err(CovaultError::InvalidSlabLen.into());
        }
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(CovaultError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(CovaultError::InvalidVersion.into());
        }
        Ok(())
    }

    pub fn system_paused(data: &[u8]) -> Result<bool, ProgramError> {
        checked_slab(data)?;
        Ok(state::read_header(data).paused != 0)
    }

    pub fn get_account_vault_counter(data: &[u8], owner: &Pubkey) -> Result<u64, ProgramError> {
        checked_slab(data)?;
        Ok(zc::book_ref(data)?.vault_count(&owner.to_bytes()))
    }

    pub fn is_operator(
        data: &[u8],
        owner: &Pubkey,
        operator: &Pubkey,
    ) -> Result<bool, ProgramError> {
        checked_slab(data)?;
        Ok(zc::book_ref(data)?.is_operator(&owner.to_bytes(), &operator.to_bytes()))
    }

    pub fn get_vault(data: &[u8], owner: &Pubkey, vault_id: u64) -> Result<VaultSlot, ProgramError> {
        checked_slab(data)?;
        let book = zc::book_ref(data)?;
        Ok(*book.vault(&owner.to_bytes(), vault_id)?)
    }

    /// (short_amount, long_amount, collateral_amount)
    pub fn get_vault_balances(
        data: &[u8],
        owner: &Pubkey,
        vault_id: u64,
    ) -> Result<(u64, u64, u64), ProgramError> {
        let v = get_vault(data, owner, vault_id)?;
        Ok((v.short_amount, v.long_amount, v.collateral_amount))
    }
}

// 14. mod entrypoint
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "covault",
    project_url: "https://github.com/covault-labs/covault-prog",
    contacts: "email:security@covault.dev",
    policy: "https://github.com/covault-labs/covault-prog/blob/main/SECURITY.md"
}
