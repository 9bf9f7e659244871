//! Percolator: single-slab Solana program wrapping the risk engine.
//!
//! One market = one slab account. The slab holds a versioned header, the
//! market config, and the engine state at fixed offsets; every instruction
//! decodes, validates signers and custody accounts, gates the oracle, calls
//! into the engine, and commits (or aborts with no slab mutation, courtesy
//! of transaction atomicity).

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

// 1. mod constants
pub mod constants {
    use crate::state::{MarketConfig, SlabHeader};
    use core::mem::{align_of, size_of};
    use percolator::RiskEngine;

    pub const MAGIC: u64 = 0x504552434f4c4154; // "PERCOLAT"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<MarketConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<RiskEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<RiskEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Sentinel caller index for a permissionless crank.
    pub const CRANK_NO_CALLER: u16 = u16::MAX;

    /// unit_scale = 0 disables scaling; anything above this is rejected.
    pub const MAX_UNIT_SCALE: u32 = 1_000_000_000;

    // Matcher call ABI (67-byte request written to the CPI data):
    // byte 0: tag, 1..9 req_id, 9..11 lp_idx, 11..19 lp_account_id,
    // 19..27 oracle_price_e6, 27..43 req_size, 43..67 reserved (zero).
    pub const MATCHER_CALL_LEN: usize = 67;
    pub const MATCHER_CALL_TAG: u8 = 0;
    /// Matcher reply read back from the context account:
    /// 0..8 exec_price_e6 (u64), 8..24 exec_size (i128).
    pub const MATCHER_CONTEXT_LEN: usize = 24;

    // Funding defaults applied at market init (the wire params carry no
    // funding block).
    pub const DEFAULT_FUNDING_HORIZON_SLOTS: u64 = 500;
    pub const DEFAULT_FUNDING_K_BPS: u64 = 100;
    pub const DEFAULT_FUNDING_SCALE_NOTIONAL_E6: u128 = 1_000_000_000_000;
    pub const DEFAULT_FUNDING_MAX_PREMIUM_BPS: u64 = 500;
    pub const DEFAULT_FUNDING_MAX_BPS_PER_SLOT: u64 = 5;

    // Risk-reduction threshold auto-update policy.
    pub const THRESH_RISK_BPS: u64 = 50; // 0.50% of system risk notional
    pub const THRESH_UPDATE_INTERVAL_SLOTS: u64 = 10;
    pub const THRESH_STEP_BPS: u128 = 500; // max 5% move per update
    pub const THRESH_ALPHA_BPS: u128 = 1_000; // 10% EWMA
    pub const THRESH_MIN_STEP: u128 = 1;
}

// 2. mod zc (zero-copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::error::PercolatorError;
    use percolator::RiskEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a RiskEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(PercolatorError::SlabSizeMismatch.into());
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(PercolatorError::CorruptedSlab.into());
        }
        Ok(unsafe { &*(ptr as *const RiskEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut RiskEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(PercolatorError::SlabSizeMismatch.into());
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(PercolatorError::CorruptedSlab.into());
        }
        Ok(unsafe { &mut *(ptr as *mut RiskEngine) })
    }
}

// 3. mod error
pub mod error {
    use percolator::RiskError;
    use solana_program::program_error::ProgramError;

    /// Host-visible error codes. Stable across versions: values are
    /// explicit and grouped, never renumbered.
    #[repr(u32)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum PercolatorError {
        // Integrity
        InvalidMagic = 0,
        UnsupportedVersion = 1,
        BitmapInconsistent = 2,
        DuplicateAccountId = 3,
        InvariantViolation = 4,
        AlreadyInitialized = 5,
        SlabSizeMismatch = 6,
        // Auth
        NotAdmin = 10,
        NotOracleAuthority = 11,
        NotAccountOwner = 12,
        Reentrancy = 13,
        ExpectedSigner = 14,
        ExpectedWritable = 15,
        // Input
        InvalidIndex = 20,
        MarketFull = 21,
        DuplicateOwner = 22,
        ZeroSize = 23,
        InvalidFeedId = 24,
        InvalidVault = 25,
        InvalidMint = 26,
        UnitScaleTooLarge = 27,
        AmountNotAligned = 28,
        AccountKindMismatch = 29,
        // Arithmetic
        ArithmeticOverflow = 30,
        DivisionByZero = 31,
        // Market state
        StaleCrank = 40,
        RiskReductionOnly = 41,
        WarmupPaused = 42,
        InsufficientMargin = 43,
        InsufficientCapital = 44,
        InsufficientInsurance = 45,
        PnlNotWarmedUp = 46,
        PositionOpen = 47,
        // Oracle
        OracleUnavailable = 50,
        OracleStale = 51,
        OraclePriceInvalid = 52,
        ConfidenceTooWide = 53,
        AuthorityPriceExpired = 54,
        // Matcher
        MatcherRejected = 60,
        MatcherContextInvalid = 61,
        MatcherReturnedBadPrice = 62,
        // Liquidation
        AccountHealthy = 70,
        LiquidationTooSmall = 71,
        // Fatal
        CorruptedSlab = 80,
    }

    impl From<PercolatorError> for ProgramError {
        fn from(e: PercolatorError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    pub fn map_risk_error(e: RiskError) -> ProgramError {
        let err = match e {
            RiskError::InvalidIndex => PercolatorError::InvalidIndex,
            RiskError::MarketFull => PercolatorError::MarketFull,
            RiskError::DuplicateOwner => PercolatorError::DuplicateOwner,
            RiskError::ZeroSize => PercolatorError::ZeroSize,
            RiskError::AccountKindMismatch => PercolatorError::AccountKindMismatch,
            RiskError::ArithmeticOverflow => PercolatorError::ArithmeticOverflow,
            RiskError::DivisionByZero => PercolatorError::DivisionByZero,
            RiskError::StaleCrank => PercolatorError::StaleCrank,
            RiskError::RiskReductionOnly => PercolatorError::RiskReductionOnly,
            RiskError::InsufficientMargin => PercolatorError::InsufficientMargin,
            RiskError::InsufficientCapital => PercolatorError::InsufficientCapital,
            RiskError::InsufficientInsurance => PercolatorError::InsufficientInsurance,
            RiskError::PnlNotWarmedUp => PercolatorError::PnlNotWarmedUp,
            RiskError::PositionOpen => PercolatorError::PositionOpen,
            RiskError::OraclePriceInvalid => PercolatorError::OraclePriceInvalid,
            RiskError::MatcherRejected => PercolatorError::MatcherRejected,
            RiskError::MatcherReturnedBadPrice => PercolatorError::MatcherReturnedBadPrice,
            RiskError::AccountHealthy => PercolatorError::AccountHealthy,
            RiskError::LiquidationTooSmall => PercolatorError::LiquidationTooSmall,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use crate::constants::{
        DEFAULT_FUNDING_HORIZON_SLOTS, DEFAULT_FUNDING_K_BPS, DEFAULT_FUNDING_MAX_BPS_PER_SLOT,
        DEFAULT_FUNDING_MAX_PREMIUM_BPS, DEFAULT_FUNDING_SCALE_NOTIONAL_E6,
    };
    use percolator::{FundingParams, RiskParams, U128};
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    #[derive(Debug)]
    pub enum Instruction {
        InitMarket {
            admin: Pubkey,
            collateral_mint: Pubkey,
            index_feed_id: [u8; 32],
            max_staleness_secs: u64,
            conf_filter_bps: u16,
            invert: u8,
            unit_scale: u32,
            risk_params: RiskParams,
        },
        InitUser { fee_payment: u64 },
        InitLP { matcher_program: Pubkey, matcher_context: Pubkey, fee_payment: u64 },
        DepositCollateral { user_idx: u16, amount: u64 },
        WithdrawCollateral { user_idx: u16, amount: u64 },
        KeeperCrank { caller_idx: u16, allow_panic: u8 },
        TradeNoCpi { lp_idx: u16, user_idx: u16, size: i128 },
        LiquidateAtOracle { target_idx: u16 },
        CloseAccount { user_idx: u16 },
        TopUpInsurance { amount: u64 },
        TradeCpi { lp_idx: u16, user_idx: u16, size: i128 },
        SetRiskThreshold { new_threshold: u128 },
        UpdateAdmin { new_admin: Pubkey },
        CloseSlab,
        SetOracleAuthority { new_authority: Pubkey },
        PushOraclePrice { price_e6: u64, timestamp: i64 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;
            match tag {
                0 => {
                    let admin = read_pubkey(&mut rest)?;
                    let collateral_mint = read_pubkey(&mut rest)?;
                    let index_feed_id = read_bytes32(&mut rest)?;
                    let max_staleness_secs = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    let invert = read_u8(&mut rest)?;
                    let unit_scale = read_u32(&mut rest)?;
                    let risk_params = read_risk_params(&mut rest)?;
                    Ok(Instruction::InitMarket {
                        admin,
                        collateral_mint,
                        index_feed_id,
                        max_staleness_secs,
                        conf_filter_bps,
                        invert,
                        unit_scale,
                        risk_params,
                    })
                }
                1 => Ok(Instruction::InitUser { fee_payment: read_u64(&mut rest)? }),
                2 => {
                    let matcher_program = read_pubkey(&mut rest)?;
                    let matcher_context = read_pubkey(&mut rest)?;
                    let fee_payment = read_u64(&mut rest)?;
                    Ok(Instruction::InitLP { matcher_program, matcher_context, fee_payment })
                }
                3 => {
                    let user_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::DepositCollateral { user_idx, amount })
                }
                4 => {
                    let user_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::WithdrawCollateral { user_idx, amount })
                }
                5 => {
                    let caller_idx = read_u16(&mut rest)?;
                    let allow_panic = read_u8(&mut rest)?;
                    Ok(Instruction::KeeperCrank { caller_idx, allow_panic })
                }
                6 => {
                    let lp_idx = read_u16(&mut rest)?;
                    let user_idx = read_u16(&mut rest)?;
                    let size = read_i128(&mut rest)?;
                    Ok(Instruction::TradeNoCpi { lp_idx, user_idx, size })
                }
                7 => Ok(Instruction::LiquidateAtOracle { target_idx: read_u16(&mut rest)? }),
                8 => Ok(Instruction::CloseAccount { user_idx: read_u16(&mut rest)? }),
                9 => Ok(Instruction::TopUpInsurance { amount: read_u64(&mut rest)? }),
                10 => {
                    let lp_idx = read_u16(&mut rest)?;
                    let user_idx = read_u16(&mut rest)?;
                    let size = read_i128(&mut rest)?;
                    Ok(Instruction::TradeCpi { lp_idx, user_idx, size })
                }
                11 => Ok(Instruction::SetRiskThreshold { new_threshold: read_u128(&mut rest)? }),
                12 => Ok(Instruction::UpdateAdmin { new_admin: read_pubkey(&mut rest)? }),
                13 => Ok(Instruction::CloseSlab),
                14 => Ok(Instruction::SetOracleAuthority { new_authority: read_pubkey(&mut rest)? }),
                15 => {
                    let price_e6 = read_u64(&mut rest)?;
                    let timestamp = read_i64(&mut rest)?;
                    Ok(Instruction::PushOraclePrice { price_e6, timestamp })
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

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        if input.len() < 4 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(4);
        *input = rest;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        if input.len() < 16 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(u128::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i128(input: &mut &[u8]) -> Result<i128, ProgramError> {
        if input.len() < 16 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(i128::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes32(input: &mut &[u8]) -> Result<[u8; 32], ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(bytes.try_into().unwrap())
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::new_from_array(read_bytes32(input)?))
    }

    /// 144-byte wire block; the funding config takes deployment defaults.
    fn read_risk_params(input: &mut &[u8]) -> Result<RiskParams, ProgramError> {
        Ok(RiskParams {
            warmup_period_slots: read_u64(input)?,
            maintenance_margin_bps: read_u64(input)?,
            initial_margin_bps: read_u64(input)?,
            trading_fee_bps: read_u64(input)?,
            max_accounts: read_u64(input)?,
            new_account_fee: U128::new(read_u128(input)?),
            risk_reduction_threshold: U128::new(read_u128(input)?),
            maintenance_fee_per_slot: U128::new(read_u128(input)?),
            max_crank_staleness_slots: read_u64(input)?,
            liquidation_fee_bps: read_u64(input)?,
            liquidation_fee_cap: U128::new(read_u128(input)?),
            liquidation_buffer_bps: read_u64(input)?,
            min_liquidation_abs: U128::new(read_u128(input)?),
            funding: FundingParams {
                horizon_slots: DEFAULT_FUNDING_HORIZON_SLOTS,
                k_bps: DEFAULT_FUNDING_K_BPS,
                max_premium_bps: DEFAULT_FUNDING_MAX_PREMIUM_BPS,
                max_bps_per_slot: DEFAULT_FUNDING_MAX_BPS_PER_SLOT,
                scale_notional_e6: U128::new(DEFAULT_FUNDING_SCALE_NOTIONAL_E6),
            },
        })
    }
}

// 5. mod accounts (validation helpers)
pub mod accounts {
    use crate::error::PercolatorError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(PercolatorError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(PercolatorError::ExpectedWritable.into());
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

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }

    pub fn derive_lp_authority(program_id: &Pubkey, slab_key: &Pubkey, lp_idx: u16) -> (Pubkey, u8) {
        let lp_bytes = lp_idx.to_le_bytes();
        Pubkey::find_program_address(&[b"lp", slab_key.as_ref(), &lp_bytes], program_id)
    }
}

// 6. mod state (header/config codec)
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use crate::error::PercolatorError;
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
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        /// [0..8) request nonce, [8..16) last threshold-update slot,
        /// [16..24) accumulated base-token dust.
        pub _reserved: [u8; 24],
    }

    pub const RESERVED_OFF: usize = 48;
    const _: () = assert!(HEADER_LEN == 72);

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct MarketConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        /// Pull-oracle feed id, or the push-oracle account key.
        pub index_feed_id: [u8; 32],
        /// Push-price authority; all zeros = disabled.
        pub oracle_authority: [u8; 32],
        pub max_staleness_secs: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
        /// Non-zero: quote the inverse market (price -> 1e12 / price).
        pub invert: u8,
        /// Base tokens per engine unit; 0 disables scaling.
        pub unit_scale: u32,
    }

    const _: () = assert!(CONFIG_LEN == 144);

    /// Exclusive borrow of the slab for the whole operation. A matcher
    /// calling back into the program on the same slab fails here.
    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        ai.try_borrow_mut_data()
            .map_err(|_| PercolatorError::Reentrancy.into())
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        bytemuck::bytes_of_mut(&mut h).copy_from_slice(&data[..HEADER_LEN]);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        data[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
    }

    pub fn read_config(data: &[u8]) -> MarketConfig {
        let mut c = MarketConfig::zeroed();
        bytemuck::bytes_of_mut(&mut c).copy_from_slice(&data[HEADER_LEN..HEADER_LEN + CONFIG_LEN]);
        c
    }

    pub fn write_config(data: &mut [u8], c: &MarketConfig) {
        data[HEADER_LEN..HEADER_LEN + CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(c));
    }

    pub fn read_req_nonce(data: &[u8]) -> u64 {
        u64::from_le_bytes(data[RESERVED_OFF..RESERVED_OFF + 8].try_into().unwrap())
    }

    pub fn write_req_nonce(data: &mut [u8], nonce: u64) {
        data[RESERVED_OFF..RESERVED_OFF + 8].copy_from_slice(&nonce.to_le_bytes());
    }

    pub fn read_last_thr_update_slot(data: &[u8]) -> u64 {
        u64::from_le_bytes(data[RESERVED_OFF + 8..RESERVED_OFF + 16].try_into().unwrap())
    }

    pub fn write_last_thr_update_slot(data: &mut [u8], slot: u64) {
        data[RESERVED_OFF + 8..RESERVED_OFF + 16].copy_from_slice(&slot.to_le_bytes());
    }

    pub fn read_dust_base(data: &[u8]) -> u64 {
        u64::from_le_bytes(data[RESERVED_OFF + 16..RESERVED_OFF + 24].try_into().unwrap())
    }

    pub fn write_dust_base(data: &mut [u8], dust: u64) {
        data[RESERVED_OFF + 16..RESERVED_OFF + 24].copy_from_slice(&dust.to_le_bytes());
    }
}

// 7. mod units (base token <-> engine unit conversion)
pub mod units {
    /// Split a base-token amount into (units, dust).
    #[inline]
    pub fn base_to_units(base: u64, scale: u32) -> (u64, u64) {
        if scale == 0 {
            return (base, 0);
        }
        let s = scale as u64;
        (base / s, base % s)
    }

    #[inline]
    pub fn units_to_base_checked(units: u64, scale: u32) -> Option<u64> {
        if scale == 0 {
            return Some(units);
        }
        units.checked_mul(scale as u64)
    }

    /// Withdrawals must be whole units so no dust leaks out of the vault.
    #[inline]
    pub fn amount_aligned(amount: u64, scale: u32) -> bool {
        scale == 0 || amount % scale as u64 == 0
    }
}

// 8. mod oracle (price gate)
pub mod oracle {
    use crate::error::PercolatorError;
    use crate::state::MarketConfig;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    // Pyth PriceUpdateV2 layout.
    pub const PRICE_UPDATE_V2_MIN_LEN: usize = 134;
    const OFF_FEED_ID: usize = 42;
    const OFF_PRICE: usize = 74;
    const OFF_CONF: usize = 82;
    const OFF_EXPO: usize = 90;
    const OFF_PUBLISH_TIME: usize = 94;

    // Chainlink OCR2 aggregator layout.
    const CL_MIN_LEN: usize = 224;
    const CL_OFF_DECIMALS: usize = 138;
    const CL_OFF_TIMESTAMP: usize = 208;
    const CL_OFF_ANSWER: usize = 216;

    /// Bound on |expo|/decimals so 10^n stays in u128.
    const MAX_EXPO_ABS: i32 = 18;

    /// price_e6 * inverted_e6 = 1e12.
    pub const INVERSION_CONSTANT: u128 = 1_000_000_000_000;

    pub fn read_pyth_price_e6(
        price_ai: &AccountInfo,
        expected_feed_id: &[u8; 32],
        now_unix_ts: i64,
        max_staleness_secs: u64,
        conf_bps: u16,
    ) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < PRICE_UPDATE_V2_MIN_LEN {
            return Err(PercolatorError::OracleUnavailable.into());
        }
        let feed_id: [u8; 32] = data[OFF_FEED_ID..OFF_FEED_ID + 32].try_into().unwrap();
        if &feed_id != expected_feed_id {
            return Err(PercolatorError::InvalidFeedId.into());
        }

        let price = i64::from_le_bytes(data[OFF_PRICE..OFF_PRICE + 8].try_into().unwrap());
        let conf = u64::from_le_bytes(data[OFF_CONF..OFF_CONF + 8].try_into().unwrap());
        let expo = i32::from_le_bytes(data[OFF_EXPO..OFF_EXPO + 4].try_into().unwrap());
        let publish_time =
            i64::from_le_bytes(data[OFF_PUBLISH_TIME..OFF_PUBLISH_TIME + 8].try_into().unwrap());

        if price <= 0 || expo.abs() > MAX_EXPO_ABS {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        let age = now_unix_ts.saturating_sub(publish_time);
        if age > 0 && age as u64 > max_staleness_secs {
            return Err(PercolatorError::OracleStale.into());
        }
        // conf / price <= conf_bps / 10_000
        let price_u = price as u128;
        if (conf as u128) * 10_000 > price_u * conf_bps as u128 {
            return Err(PercolatorError::ConfidenceTooWide.into());
        }
        to_e6(price_u, expo)
    }

    pub fn read_chainlink_price_e6(
        price_ai: &AccountInfo,
        expected_feed_key: &[u8; 32],
        now_unix_ts: i64,
        max_staleness_secs: u64,
    ) -> Result<u64, ProgramError> {
        if &price_ai.key.to_bytes() != expected_feed_key {
            return Err(PercolatorError::InvalidFeedId.into());
        }
        let data = price_ai.try_borrow_data()?;
        if data.len() < CL_MIN_LEN {
            return Err(PercolatorError::OracleUnavailable.into());
        }
        let decimals = data[CL_OFF_DECIMALS];
        let timestamp =
            u64::from_le_bytes(data[CL_OFF_TIMESTAMP..CL_OFF_TIMESTAMP + 8].try_into().unwrap());
        let answer =
            i128::from_le_bytes(data[CL_OFF_ANSWER..CL_OFF_ANSWER + 16].try_into().unwrap());

        if answer <= 0 || decimals as i32 > MAX_EXPO_ABS {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        let age = now_unix_ts.saturating_sub(timestamp as i64);
        if age > 0 && age as u64 > max_staleness_secs {
            return Err(PercolatorError::OracleStale.into());
        }
        to_e6(answer as u128, -(decimals as i32))
    }

    fn to_e6(raw: u128, expo: i32) -> Result<u64, ProgramError> {
        let scale = expo + 6;
        let value = if scale >= 0 {
            raw.checked_mul(10u128.pow(scale as u32))
                .ok_or(PercolatorError::ArithmeticOverflow)?
        } else {
            raw / 10u128.pow((-scale) as u32)
        };
        if value == 0 {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        if value > u64::MAX as u128 {
            return Err(PercolatorError::ArithmeticOverflow.into());
        }
        Ok(value as u64)
    }

    /// Quote the inverse market: inverted_e6 = 1e12 / raw_e6.
    pub fn invert_price_e6(raw: u64, invert: u8) -> Result<u64, ProgramError> {
        if invert == 0 {
            return Ok(raw);
        }
        if raw == 0 {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        let inverted = INVERSION_CONSTANT / raw as u128;
        if inverted == 0 || inverted > u64::MAX as u128 {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        Ok(inverted as u64)
    }

    /// Rescale so notional = position * price / 1e6 stays in engine units.
    pub fn scale_price_e6(price: u64, unit_scale: u32) -> Result<u64, ProgramError> {
        if unit_scale <= 1 {
            return Ok(price);
        }
        let scaled = price / unit_scale as u64;
        if scaled == 0 {
            return Err(PercolatorError::OraclePriceInvalid.into());
        }
        Ok(scaled)
    }

    /// The full oracle gate.
    ///
    /// 1. A fresh authority price wins (future timestamps count as fresh;
    ///    the authority is a trusted surface and gets no further checks).
    /// 2. Otherwise the feed account parses as Pyth pull (feed id match) or
    ///    Chainlink push (account key match), selected by account shape.
    /// 3. Inversion and unit scaling apply to feed prices only; the pushed
    ///    authority price is stored pre-scaled.
    pub fn gate_price(
        config: &MarketConfig,
        authority_price_e6: u64,
        authority_timestamp: i64,
        oracle_ai: &AccountInfo,
        now_unix_ts: i64,
    ) -> Result<u64, ProgramError> {
        let authority_configured = config.oracle_authority != [0u8; 32];
        if authority_configured && authority_price_e6 != 0 {
            let age = now_unix_ts.saturating_sub(authority_timestamp);
            if age <= 0 || age as u64 <= config.max_staleness_secs {
                return Ok(authority_price_e6);
            }
        }

        if *oracle_ai.key == Pubkey::default() {
            return Err(if authority_configured {
                PercolatorError::AuthorityPriceExpired.into()
            } else {
                PercolatorError::OracleUnavailable.into()
            });
        }

        let raw = if looks_like_pyth(oracle_ai, &config.index_feed_id) {
            read_pyth_price_e6(
                oracle_ai,
                &config.index_feed_id,
                now_unix_ts,
                config.max_staleness_secs,
                config.conf_filter_bps,
            )?
        } else {
            read_chainlink_price_e6(
                oracle_ai,
                &config.index_feed_id,
                now_unix_ts,
                config.max_staleness_secs,
            )?
        };
        let inverted = invert_price_e6(raw, config.invert)?;
        scale_price_e6(inverted, config.unit_scale)
    }

    fn looks_like_pyth(oracle_ai: &AccountInfo, expected_feed_id: &[u8; 32]) -> bool {
        let data = match oracle_ai.try_borrow_data() {
            Ok(d) => d,
            Err(_) => return false,
        };
        data.len() >= PRICE_UPDATE_V2_MIN_LEN
            && &data[OFF_FEED_ID..OFF_FEED_ID + 32] == expected_feed_id
    }
}

// 9. mod collateral (vault custody)
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    pub fn deposit<'a>(
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
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    pub fn withdraw<'a>(
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
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    #[cfg(test)]
    fn move_tokens(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
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

// 10. mod threshold (risk-reduction threshold auto-tuning)
pub mod threshold {
    use crate::constants::{THRESH_ALPHA_BPS, THRESH_MIN_STEP, THRESH_RISK_BPS, THRESH_STEP_BPS};
    use percolator::RiskEngine;

    /// Risk proxy in position units: LP concentration plus a spread term.
    pub fn system_risk_units(engine: &RiskEngine) -> u128 {
        engine
            .lp_max_abs
            .get()
            .saturating_add(engine.lp_sum_abs.get() / 8)
    }

    /// EWMA-smoothed, step-clamped threshold target.
    pub fn updated_threshold(current: u128, risk_units: u128, price_e6: u64) -> u128 {
        let risk_notional = risk_units.saturating_mul(price_e6 as u128) / 1_000_000;
        let target = risk_notional.saturating_mul(THRESH_RISK_BPS as u128) / 10_000;
        let smoothed = (target
            .saturating_mul(THRESH_ALPHA_BPS)
            .saturating_add(current.saturating_mul(10_000 - THRESH_ALPHA_BPS)))
            / 10_000;
        // When starting from zero a proportional step would pin the
        // threshold at THRESH_MIN_STEP forever; jump straight to target.
        let max_step = if current == 0 {
            smoothed
        } else {
            (current.saturating_mul(THRESH_STEP_BPS) / 10_000).max(THRESH_MIN_STEP)
        };
        if smoothed > current {
            current.saturating_add(max_step.min(smoothed - current))
        } else {
            current.saturating_sub(max_step.min(current - smoothed))
        }
    }
}

// 11. mod processor
pub mod processor {
    use crate::{
        accounts, collateral,
        constants::{
            CRANK_NO_CALLER, MAGIC, MATCHER_CALL_LEN, MATCHER_CALL_TAG, MATCHER_CONTEXT_LEN,
            MAX_UNIT_SCALE, SLAB_LEN, THRESH_UPDATE_INTERVAL_SLOTS, VERSION,
        },
        error::{map_risk_error, PercolatorError},
        ix::Instruction,
        oracle, state,
        state::{MarketConfig, SlabHeader},
        threshold, units, zc,
    };
    use percolator::{MatchingEngine, NoOpMatcher, TradeExecution, MAX_ACCOUNTS};
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        instruction::{AccountMeta, Instruction as SolInstruction},
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    #[cfg(not(test))]
    use solana_program::program::invoke_signed;

    /// Matcher adapter: the CPI already ran; this replays its reported fill
    /// into the engine, which validates it as a trust boundary.
    struct CpiMatcher {
        exec_price: u64,
        exec_size: i128,
    }

    impl MatchingEngine for CpiMatcher {
        fn execute_match(
            &self,
            _lp_program: &[u8; 32],
            _lp_context: &[u8; 32],
            _lp_account_id: u64,
            _oracle_price: u64,
            _size: i128,
        ) -> percolator::Result<TradeExecution> {
            Ok(TradeExecution {
                price: self.exec_price,
                size: self.exec_size,
            })
        }
    }

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(PercolatorError::SlabSizeMismatch.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(PercolatorError::InvalidMagic.into());
        }
        if h.version != VERSION {
            return Err(PercolatorError::UnsupportedVersion.into());
        }
        Ok(())
    }

    fn require_admin(admin: [u8; 32], signer: &Pubkey) -> Result<(), ProgramError> {
        if admin != signer.to_bytes() {
            return Err(PercolatorError::NotAdmin.into());
        }
        Ok(())
    }

    fn check_idx(engine: &percolator::RiskEngine, idx: u16) -> Result<(), ProgramError> {
        if (idx as usize) >= MAX_ACCOUNTS || !engine.is_used(idx as usize) {
            return Err(PercolatorError::InvalidIndex.into());
        }
        Ok(())
    }

    fn require_account_owner(
        engine: &percolator::RiskEngine,
        idx: u16,
        signer: &Pubkey,
    ) -> Result<(), ProgramError> {
        if engine.accounts[idx as usize].owner != signer.to_bytes() {
            return Err(PercolatorError::NotAccountOwner.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_key: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_key {
            return Err(PercolatorError::InvalidVault.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(PercolatorError::InvalidVault.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(PercolatorError::InvalidVault.into());
        }
        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(PercolatorError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(PercolatorError::InvalidVault.into());
        }
        Ok(())
    }

    /// Run the oracle gate against the slab's config and authority state.
    fn gated_price(
        data: &[u8],
        config: &MarketConfig,
        a_oracle: &AccountInfo,
        clock: &Clock,
    ) -> Result<u64, ProgramError> {
        let engine = zc::engine_ref(data)?;
        oracle::gate_price(
            config,
            engine.authority_price_e6,
            engine.authority_timestamp,
            a_oracle,
            clock.unix_timestamp,
        )
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitMarket {
                admin,
                collateral_mint,
                index_feed_id,
                max_staleness_secs,
                conf_filter_bps,
                invert,
                unit_scale,
                risk_params,
            } => {
                accounts::expect_len(accounts, 4)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_mint, &collateral_mint)?;

                if risk_params.maintenance_margin_bps >= risk_params.initial_margin_bps {
                    return Err(PercolatorError::InvariantViolation.into());
                }
                if risk_params.max_accounts == 0 || risk_params.max_accounts > MAX_ACCOUNTS as u64 {
                    return Err(PercolatorError::InvariantViolation.into());
                }
                if unit_scale > MAX_UNIT_SCALE {
                    return Err(PercolatorError::UnitScaleTooLarge.into());
                }

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                if state::read_header(&data).magic == MAGIC {
                    return Err(PercolatorError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                for b in data.iter_mut() {
                    *b = 0;
                }
                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine.init_in_place(risk_params);
                }

                let config = MarketConfig {
                    collateral_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    index_feed_id,
                    oracle_authority: [0; 32],
                    max_staleness_secs,
                    conf_filter_bps,
                    vault_authority_bump: bump,
                    invert,
                    unit_scale,
                };
                state::write_config(&mut data, &config);

                let header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: admin.to_bytes(),
                    _reserved: [0; 24],
                };
                state::write_header(&mut data, &header);
            }

            Instruction::InitUser { fee_payment } => {
                accounts::expect_len(accounts, 5)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                collateral::deposit(a_token, a_user_ata, a_vault, a_user, fee_payment)?;

                let (fee_units, dust) = units::base_to_units(fee_payment, config.unit_scale);
                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine
                        .add_user(a_user.key.to_bytes(), fee_units as u128)
                        .map_err(map_risk_error)?;
                }
                if dust > 0 {
                    let acc = state::read_dust_base(&data).saturating_add(dust);
                    state::write_dust_base(&mut data, acc);
                }
            }

            Instruction::InitLP { matcher_program, matcher_context, fee_payment } => {
                accounts::expect_len(accounts, 5)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                collateral::deposit(a_token, a_user_ata, a_vault, a_user, fee_payment)?;

                let (fee_units, dust) = units::base_to_units(fee_payment, config.unit_scale);
                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine
                        .add_lp(
                            a_user.key.to_bytes(),
                            matcher_program.to_bytes(),
                            matcher_context.to_bytes(),
                            fee_units as u128,
                        )
                        .map_err(map_risk_error)?;
                }
                if dust > 0 {
                    let acc = state::read_dust_base(&data).saturating_add(dust);
                    state::write_dust_base(&mut data, acc);
                }
            }

            Instruction::DepositCollateral { user_idx, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let clock = Clock::from_account_info(a_clock)?;
                let (amount_units, dust) = units::base_to_units(amount, config.unit_scale);

                collateral::deposit(a_token, a_user_ata, a_vault, a_user, amount)?;
                {
                    let engine = zc::engine_mut(&mut data)?;
                    check_idx(engine, user_idx)?;
                    require_account_owner(engine, user_idx, a_user.key)?;
                    engine
                        .deposit(user_idx, amount_units as u128, clock.slot)
                        .map_err(map_risk_error)?;
                }
                if dust > 0 {
                    let acc = state::read_dust_base(&data).saturating_add(dust);
                    state::write_dust_base(&mut data, acc);
                }
            }

            Instruction::WithdrawCollateral { user_idx, amount } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];
                let a_oracle = &accounts[7];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                if !units::amount_aligned(amount, config.unit_scale) {
                    return Err(PercolatorError::AmountNotAligned.into());
                }
                let (amount_units, _) = units::base_to_units(amount, config.unit_scale);

                let clock = Clock::from_account_info(a_clock)?;
                let price = gated_price(&data, &config, a_oracle, &clock)?;

                {
                    let engine = zc::engine_mut(&mut data)?;
                    check_idx(engine, user_idx)?;
                    require_account_owner(engine, user_idx, a_user.key)?;
                    engine
                        .withdraw(user_idx, amount_units as u128, clock.slot, price)
                        .map_err(map_risk_error)?;
                }

                let bump_arr = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                collateral::withdraw(a_token, a_vault, a_user_ata, a_vault_pda, amount, &signer_seeds)?;
            }

            Instruction::KeeperCrank { caller_idx, allow_panic } => {
                accounts::expect_len(accounts, 4)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_oracle = &accounts[3];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let clock = Clock::from_account_info(a_clock)?;
                let price = gated_price(&data, &config, a_oracle, &clock)?;

                let dust_before = state::read_dust_base(&data);
                let last_thr_slot = state::read_last_thr_update_slot(&data);

                let (liqs, force_closes, insurance_low, dust_after, thr_updated) = {
                    let engine = zc::engine_mut(&mut data)?;

                    // Self-crank callers must own the account they name;
                    // CRANK_NO_CALLER is fully permissionless.
                    if caller_idx != CRANK_NO_CALLER {
                        accounts::expect_signer(a_caller)?;
                        check_idx(engine, caller_idx)?;
                        require_account_owner(engine, caller_idx, a_caller.key)?;
                    }

                    engine
                        .keeper_crank(clock.slot, price, allow_panic != 0)
                        .map_err(map_risk_error)?;

                    // Sweep whole units of accumulated dust into insurance.
                    let mut dust = dust_before;
                    if config.unit_scale > 0 {
                        let scale = config.unit_scale as u64;
                        if dust >= scale {
                            engine
                                .top_up_insurance((dust / scale) as u128)
                                .map_err(map_risk_error)?;
                            dust %= scale;
                        }
                    }

                    // Rate-limited threshold auto-update.
                    let thr_updated =
                        clock.slot >= last_thr_slot.saturating_add(THRESH_UPDATE_INTERVAL_SLOTS);
                    if thr_updated {
                        let risk_units = threshold::system_risk_units(engine);
                        let new_thr = threshold::updated_threshold(
                            engine.risk_reduction_threshold(),
                            risk_units,
                            price,
                        );
                        engine.set_risk_reduction_threshold(new_thr);
                    }

                    (
                        engine.lifetime_liquidations,
                        engine.lifetime_force_closes,
                        engine.insurance_fund.balance.get() as u64,
                        dust,
                        thr_updated,
                    )
                };

                if dust_after != dust_before {
                    state::write_dust_base(&mut data, dust_after);
                }
                if thr_updated {
                    state::write_last_thr_update_slot(&mut data, clock.slot);
                }

                msg!("CRANK_STATS");
                solana_program::log::sol_log_64(
                    0xC8A4C,
                    liqs,
                    force_closes,
                    MAX_ACCOUNTS as u64,
                    insurance_low,
                );
            }

            Instruction::TradeNoCpi { lp_idx, user_idx, size } => {
                accounts::expect_len(accounts, 5)?;
                let a_user = &accounts[0];
                let a_lp = &accounts[1];
                let a_slab = &accounts[2];
                let a_clock = &accounts[3];
                let a_oracle = &accounts[4];

                accounts::expect_signer(a_user)?;
                accounts::expect_signer(a_lp)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let clock = Clock::from_account_info(a_clock)?;
                let price = gated_price(&data, &config, a_oracle, &clock)?;

                let engine = zc::engine_mut(&mut data)?;
                check_idx(engine, lp_idx)?;
                check_idx(engine, user_idx)?;
                require_account_owner(engine, user_idx, a_user.key)?;
                require_account_owner(engine, lp_idx, a_lp.key)?;

                engine
                    .execute_trade(&NoOpMatcher, lp_idx, user_idx, clock.slot, price, size)
                    .map_err(map_risk_error)?;
            }

            Instruction::TradeCpi { lp_idx, user_idx, size } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let _a_lp_owner = &accounts[1];
                let a_slab = &accounts[2];
                let a_clock = &accounts[3];
                let a_oracle = &accounts[4];
                let a_matcher = &accounts[5];
                let a_context = &accounts[6];
                let a_lp_pda = &accounts[7];

                // The LP owner does not sign: it delegated fills to its
                // matcher program, authorized below via the per-LP PDA.
                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_context)?;
                if !a_matcher.executable || a_context.executable {
                    return Err(PercolatorError::MatcherContextInvalid.into());
                }

                let clock = Clock::from_account_info(a_clock)?;

                // Phase 1: read-only slab pass. The borrow drops before the
                // CPI so the matcher may read the slab itself.
                let (price, lp_account_id, req_id) = {
                    let data = a_slab
                        .try_borrow_data()
                        .map_err(|_| ProgramError::from(PercolatorError::Reentrancy))?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                    let config = state::read_config(&data);

                    let price = gated_price(&data, &config, a_oracle, &clock)?;
                    let engine = zc::engine_ref(&data)?;
                    check_idx(engine, lp_idx)?;
                    check_idx(engine, user_idx)?;
                    require_account_owner(engine, user_idx, a_user.key)?;

                    // Bind the CPI to the LP's registered matcher identity.
                    let lp = &engine.accounts[lp_idx as usize];
                    if lp.matcher_program != a_matcher.key.to_bytes()
                        || lp.matcher_context != a_context.key.to_bytes()
                    {
                        return Err(PercolatorError::MatcherContextInvalid.into());
                    }

                    let nonce = state::read_req_nonce(&data);
                    (price, lp.account_id, nonce.wrapping_add(1))
                };

                // Phase 2: persist the nonce before invoking (replay guard).
                {
                    let mut data = state::slab_data_mut(a_slab)?;
                    state::write_req_nonce(&mut data, req_id);
                }

                let (expected_lp_pda, bump) =
                    accounts::derive_lp_authority(program_id, a_slab.key, lp_idx);
                accounts::expect_key(a_lp_pda, &expected_lp_pda)?;

                // Phase 3: the matcher CPI, signed with the per-LP PDA.
                let mut cpi_data = alloc::vec::Vec::with_capacity(MATCHER_CALL_LEN);
                cpi_data.push(MATCHER_CALL_TAG);
                cpi_data.extend_from_slice(&req_id.to_le_bytes());
                cpi_data.extend_from_slice(&lp_idx.to_le_bytes());
                cpi_data.extend_from_slice(&lp_account_id.to_le_bytes());
                cpi_data.extend_from_slice(&price.to_le_bytes());
                cpi_data.extend_from_slice(&size.to_le_bytes());
                cpi_data.resize(MATCHER_CALL_LEN, 0);

                let mut metas = alloc::vec![
                    AccountMeta::new_readonly(*a_slab.key, false),
                    AccountMeta::new_readonly(*a_lp_pda.key, true),
                    AccountMeta::new(*a_context.key, false),
                ];
                for acc in accounts.iter().skip(8) {
                    metas.push(if acc.is_writable {
                        AccountMeta::new(*acc.key, acc.is_signer)
                    } else {
                        AccountMeta::new_readonly(*acc.key, acc.is_signer)
                    });
                }
                let cpi_ix = SolInstruction {
                    program_id: *a_matcher.key,
                    accounts: metas,
                    data: cpi_data,
                };

                let lp_bytes = lp_idx.to_le_bytes();
                let bump_arr = [bump];
                let seeds: [&[u8]; 4] = [b"lp", a_slab.key.as_ref(), &lp_bytes, &bump_arr];

                let mut cpi_infos =
                    alloc::vec::Vec::with_capacity(3 + accounts.len().saturating_sub(8));
                cpi_infos.push(a_slab.clone());
                cpi_infos.push(a_lp_pda.clone());
                cpi_infos.push(a_context.clone());
                for acc in accounts.iter().skip(8) {
                    cpi_infos.push(acc.clone());
                }

                #[cfg(not(test))]
                invoke_signed(&cpi_ix, &cpi_infos, &[&seeds])?;
                #[cfg(test)]
                let _ = (cpi_ix, cpi_infos, seeds);

                // Phase 4: read the fill back and hand it to the engine,
                // which validates it as a trust boundary.
                let (exec_price, exec_size) = {
                    if a_context.data_len() < MATCHER_CONTEXT_LEN {
                        return Err(PercolatorError::MatcherContextInvalid.into());
                    }
                    let ctx = a_context.try_borrow_data()?;
                    (
                        u64::from_le_bytes(ctx[0..8].try_into().unwrap()),
                        i128::from_le_bytes(ctx[8..24].try_into().unwrap()),
                    )
                };

                let mut data = state::slab_data_mut(a_slab)?;
                let engine = zc::engine_mut(&mut data)?;
                let matcher = CpiMatcher { exec_price, exec_size };
                engine
                    .execute_trade(&matcher, lp_idx, user_idx, clock.slot, price, size)
                    .map_err(map_risk_error)?;
            }

            Instruction::LiquidateAtOracle { target_idx } => {
                accounts::expect_len(accounts, 4)?;
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_oracle = &accounts[3];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let clock = Clock::from_account_info(a_clock)?;
                let price = gated_price(&data, &config, a_oracle, &clock)?;

                let engine = zc::engine_mut(&mut data)?;
                check_idx(engine, target_idx)?;
                engine
                    .liquidate_at_oracle(target_idx, clock.slot, price)
                    .map_err(map_risk_error)?;
            }

            Instruction::CloseAccount { user_idx } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];
                let a_oracle = &accounts[7];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_pda, &auth)?;
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = gated_price(&data, &config, a_oracle, &clock)?;

                let payout_units = {
                    let engine = zc::engine_mut(&mut data)?;
                    check_idx(engine, user_idx)?;
                    require_account_owner(engine, user_idx, a_user.key)?;
                    engine
                        .close_account(user_idx, clock.slot, price)
                        .map_err(map_risk_error)?
                };
                let payout_u64: u64 = payout_units
                    .try_into()
                    .map_err(|_| ProgramError::from(PercolatorError::ArithmeticOverflow))?;
                let payout_base = units::units_to_base_checked(payout_u64, config.unit_scale)
                    .ok_or(PercolatorError::ArithmeticOverflow)?;

                let bump_arr = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                collateral::withdraw(a_token, a_vault, a_user_ata, a_pda, payout_base, &signer_seeds)?;
            }

            Instruction::TopUpInsurance { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_payer_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.collateral_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                collateral::deposit(a_token, a_payer_ata, a_vault, a_payer, amount)?;

                let (amount_units, dust) = units::base_to_units(amount, config.unit_scale);
                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine
                        .top_up_insurance(amount_units as u128)
                        .map_err(map_risk_error)?;
                }
                if dust > 0 {
                    let acc = state::read_dust_base(&data).saturating_add(dust);
                    state::write_dust_base(&mut data, acc);
                }
            }

            Instruction::SetRiskThreshold { new_threshold } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(state::read_header(&data).admin, a_admin.key)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_risk_reduction_threshold(new_threshold);
            }

            Instruction::UpdateAdmin { new_admin } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let mut header = state::read_header(&data);
                require_admin(header.admin, a_admin.key)?;
                header.admin = new_admin.to_bytes();
                state::write_header(&mut data, &header);
            }

            Instruction::CloseSlab => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                {
                    let mut data = state::slab_data_mut(a_slab)?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                    require_admin(state::read_header(&data).admin, a_admin.key)?;

                    {
                        let engine = zc::engine_ref(&data)?;
                        if !engine.vault.is_zero() {
                            return Err(PercolatorError::InsufficientCapital.into());
                        }
                        if !engine.insurance_fund.balance.is_zero() {
                            return Err(PercolatorError::InsufficientInsurance.into());
                        }
                        if engine.num_used_accounts != 0 {
                            return Err(PercolatorError::InvariantViolation.into());
                        }
                    }
                    if state::read_dust_base(&data) != 0 {
                        return Err(PercolatorError::InsufficientCapital.into());
                    }
                    // Zero the slab so the account cannot be resurrected.
                    for b in data.iter_mut() {
                        *b = 0;
                    }
                }

                let slab_lamports = a_slab.lamports();
                **a_slab.try_borrow_mut_lamports()? = 0;
                let dest = a_admin.lamports();
                **a_admin.try_borrow_mut_lamports()? = dest
                    .checked_add(slab_lamports)
                    .ok_or(PercolatorError::ArithmeticOverflow)?;
            }

            Instruction::SetOracleAuthority { new_authority } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(state::read_header(&data).admin, a_admin.key)?;

                let mut config = state::read_config(&data);
                config.oracle_authority = new_authority.to_bytes();
                state::write_config(&mut data, &config);

                // A stale push from the previous authority must not survive.
                let engine = zc::engine_mut(&mut data)?;
                engine.clear_authority_price();
            }

            Instruction::PushOraclePrice { price_e6, timestamp } => {
                accounts::expect_len(accounts, 2)?;
                let a_authority = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_authority)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let config = state::read_config(&data);
                if config.oracle_authority == [0u8; 32]
                    || config.oracle_authority != a_authority.key.to_bytes()
                {
                    return Err(PercolatorError::NotOracleAuthority.into());
                }

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .push_authority_price(price_e6, timestamp)
                    .map_err(map_risk_error)?;
            }
        }
        Ok(())
    }
}

// 12. mod entrypoint
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

// 13. engine re-export
pub mod engine {
    pub use percolator::*;
}

#[cfg(test)]
mod tests {
    extern crate std;
    use alloc::{vec, vec::Vec};

    use crate::{
        constants::{MAGIC, SLAB_LEN, VERSION},
        error::PercolatorError,
        processor::process_instruction,
        state, zc,
    };
    use percolator::MAX_ACCOUNTS;
    use solana_program::{
        account_info::AccountInfo, clock::Clock, program_error::ProgramError, program_pack::Pack,
        pubkey::Pubkey,
    };
    use spl_token::state::{Account as TokenAccount, AccountState};

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false }
        }
        fn signer(mut self) -> Self {
            self.is_signer = true;
            self
        }
        fn writable(mut self) -> Self {
            self.is_writable = true;
            self
        }
        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    // --- Builders ---

    fn make_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let mut data = vec![0u8; TokenAccount::LEN];
        let mut account = TokenAccount::default();
        account.mint = mint;
        account.owner = owner;
        account.amount = amount;
        account.state = AccountState::Initialized;
        TokenAccount::pack(account, &mut data).unwrap();
        data
    }

    const FEED_ID: [u8; 32] = [0xF1; 32];

    fn make_pyth(price: i64, expo: i32, conf: u64, publish_time: i64) -> Vec<u8> {
        let mut data = vec![0u8; 134];
        data[42..74].copy_from_slice(&FEED_ID);
        data[74..82].copy_from_slice(&price.to_le_bytes());
        data[82..90].copy_from_slice(&conf.to_le_bytes());
        data[90..94].copy_from_slice(&expo.to_le_bytes());
        data[94..102].copy_from_slice(&publish_time.to_le_bytes());
        data
    }

    fn make_clock(slot: u64, unix_timestamp: i64) -> Vec<u8> {
        let clock = Clock { slot, unix_timestamp, ..Clock::default() };
        bincode::serialize(&clock).unwrap()
    }

    // --- Encoders ---

    fn encode_risk_params(buf: &mut Vec<u8>) {
        buf.extend_from_slice(&100u64.to_le_bytes()); // warmup_period_slots
        buf.extend_from_slice(&500u64.to_le_bytes()); // maintenance_margin_bps
        buf.extend_from_slice(&1000u64.to_le_bytes()); // initial_margin_bps
        buf.extend_from_slice(&10u64.to_le_bytes()); // trading_fee_bps
        buf.extend_from_slice(&(MAX_ACCOUNTS as u64).to_le_bytes()); // max_accounts
        buf.extend_from_slice(&1_000_000u128.to_le_bytes()); // new_account_fee
        buf.extend_from_slice(&0u128.to_le_bytes()); // risk_reduction_threshold
        buf.extend_from_slice(&0u128.to_le_bytes()); // maintenance_fee_per_slot
        buf.extend_from_slice(&u64::MAX.to_le_bytes()); // max_crank_staleness_slots
        buf.extend_from_slice(&50u64.to_le_bytes()); // liquidation_fee_bps
        buf.extend_from_slice(&100_000u128.to_le_bytes()); // liquidation_fee_cap
        buf.extend_from_slice(&100u64.to_le_bytes()); // liquidation_buffer_bps
        buf.extend_from_slice(&10u128.to_le_bytes()); // min_liquidation_abs
    }

    fn encode_init_market(admin: &Pubkey, mint: &Pubkey) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(admin.as_ref());
        buf.extend_from_slice(mint.as_ref());
        buf.extend_from_slice(&FEED_ID);
        buf.extend_from_slice(&60u64.to_le_bytes()); // max_staleness_secs
        buf.extend_from_slice(&100u16.to_le_bytes()); // conf_filter_bps
        buf.push(0); // invert
        buf.extend_from_slice(&0u32.to_le_bytes()); // unit_scale
        encode_risk_params(&mut buf);
        buf
    }

    fn encode_init_user(fee_payment: u64) -> Vec<u8> {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&fee_payment.to_le_bytes());
        buf
    }

    fn encode_init_lp(matcher_program: &Pubkey, matcher_context: &Pubkey, fee: u64) -> Vec<u8> {
        let mut buf = vec![2u8];
        buf.extend_from_slice(matcher_program.as_ref());
        buf.extend_from_slice(matcher_context.as_ref());
        buf.extend_from_slice(&fee.to_le_bytes());
        buf
    }

    fn encode_deposit(user_idx: u16, amount: u64) -> Vec<u8> {
        let mut buf = vec![3u8];
        buf.extend_from_slice(&user_idx.to_le_bytes());
        buf.extend_from_slice(&amount.to_le_bytes());
        buf
    }

    fn encode_withdraw(user_idx: u16, amount: u64) -> Vec<u8> {
        let mut buf = vec![4u8];
        buf.extend_from_slice(&user_idx.to_le_bytes());
        buf.extend_from_slice(&amount.to_le_bytes());
        buf
    }

    fn encode_crank(caller_idx: u16, allow_panic: u8) -> Vec<u8> {
        let mut buf = vec![5u8];
        buf.extend_from_slice(&caller_idx.to_le_bytes());
        buf.push(allow_panic);
        buf
    }

    fn encode_trade_nocpi(lp_idx: u16, user_idx: u16, size: i128) -> Vec<u8> {
        let mut buf = vec![6u8];
        buf.extend_from_slice(&lp_idx.to_le_bytes());
        buf.extend_from_slice(&user_idx.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf
    }

    fn encode_set_threshold(new_threshold: u128) -> Vec<u8> {
        let mut buf = vec![11u8];
        buf.extend_from_slice(&new_threshold.to_le_bytes());
        buf
    }

    fn encode_update_admin(new_admin: &Pubkey) -> Vec<u8> {
        let mut buf = vec![12u8];
        buf.extend_from_slice(new_admin.as_ref());
        buf
    }

    fn encode_set_oracle_authority(authority: &Pubkey) -> Vec<u8> {
        let mut buf = vec![14u8];
        buf.extend_from_slice(authority.as_ref());
        buf
    }

    fn encode_push_price(price_e6: u64, timestamp: i64) -> Vec<u8> {
        let mut buf = vec![15u8];
        buf.extend_from_slice(&price_e6.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf
    }

    // --- Fixture ---

    struct MarketFixture {
        program_id: Pubkey,
        admin_key: Pubkey,
        slab: TestAccount,
        mint_key: Pubkey,
        vault: TestAccount,
        vault_pda: Pubkey,
    }

    fn setup_market() -> MarketFixture {
        let program_id = Pubkey::new_unique();
        let slab_key = Pubkey::new_unique();
        let (vault_pda, _) =
            Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], &program_id);
        let mint_key = Pubkey::new_unique();
        let admin_key = Pubkey::new_unique();

        let mut fx = MarketFixture {
            program_id,
            admin_key,
            slab: TestAccount::new(slab_key, program_id, 1_000_000, vec![0u8; SLAB_LEN]).writable(),
            mint_key,
            vault: TestAccount::new(
                Pubkey::new_unique(),
                spl_token::ID,
                0,
                make_token_account(mint_key, vault_pda, 0),
            )
            .writable(),
            vault_pda,
        };
        init_market(&mut fx);
        fx
    }

    fn init_market(fx: &mut MarketFixture) {
        let mut admin =
            TestAccount::new(fx.admin_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut mint = TestAccount::new(fx.mint_key, solana_program::system_program::id(), 0, vec![]);
        let data = encode_init_market(&fx.admin_key, &fx.mint_key);
        let infos = [admin.to_info(), fx.slab.to_info(), mint.to_info(), fx.vault.to_info()];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
    }

    fn init_user(fx: &mut MarketFixture, user_key: Pubkey, fee: u64, ata_balance: u64) {
        let mut user =
            TestAccount::new(user_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut ata = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(fx.mint_key, user_key, ata_balance),
        )
        .writable();
        let mut token = TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]);
        let data = encode_init_user(fee);
        let infos = [
            user.to_info(),
            fx.slab.to_info(),
            ata.to_info(),
            fx.vault.to_info(),
            token.to_info(),
        ];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
    }

    fn init_lp(fx: &mut MarketFixture, lp_key: Pubkey, fee: u64, ata_balance: u64) {
        let mut lp =
            TestAccount::new(lp_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut ata = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(fx.mint_key, lp_key, ata_balance),
        )
        .writable();
        let mut token = TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]);
        let data = encode_init_lp(&Pubkey::new_unique(), &Pubkey::new_unique(), fee);
        let infos = [
            lp.to_info(),
            fx.slab.to_info(),
            ata.to_info(),
            fx.vault.to_info(),
            token.to_info(),
        ];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
    }

    fn deposit(fx: &mut MarketFixture, user_key: Pubkey, idx: u16, amount: u64) {
        let mut user =
            TestAccount::new(user_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut ata = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(fx.mint_key, user_key, amount),
        )
        .writable();
        let mut token = TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]);
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(10, 1_000),
        );
        let data = encode_deposit(idx, amount);
        let infos = [
            user.to_info(),
            fx.slab.to_info(),
            ata.to_info(),
            fx.vault.to_info(),
            token.to_info(),
            clock.to_info(),
        ];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
    }

    fn run_admin_op(
        fx: &mut MarketFixture,
        signer_key: Pubkey,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        let mut signer =
            TestAccount::new(signer_key, solana_program::system_program::id(), 0, vec![]).signer();
        let infos = [signer.to_info(), fx.slab.to_info()];
        process_instruction(&fx.program_id, &infos, data)
    }

    // --- Tests ---

    #[test]
    fn init_market_writes_header_and_empty_engine() {
        let fx = setup_market();
        let header = state::read_header(&fx.slab.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.magic, 0x504552434f4c4154);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.admin, fx.admin_key.to_bytes());

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.num_used_accounts, 0);
        assert_eq!(engine.next_account_id, 0);
        assert!(engine.used.iter().all(|w| *w == 0));
        assert!(engine.insurance_fund.balance.is_zero());
        assert_eq!(engine.params.max_accounts, MAX_ACCOUNTS as u64);
    }

    #[test]
    fn init_market_twice_rejected() {
        let mut fx = setup_market();
        let mut admin =
            TestAccount::new(fx.admin_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut mint = TestAccount::new(fx.mint_key, solana_program::system_program::id(), 0, vec![]);
        let data = encode_init_market(&fx.admin_key, &fx.mint_key);
        let infos = [admin.to_info(), fx.slab.to_info(), mint.to_info(), fx.vault.to_info()];
        assert_eq!(
            process_instruction(&fx.program_id, &infos, &data),
            Err(PercolatorError::AlreadyInitialized.into())
        );
    }

    #[test]
    fn ten_users_get_sequential_ids_and_fees_fund_insurance() {
        let mut fx = setup_market();
        for _ in 0..10 {
            init_user(&mut fx, Pubkey::new_unique(), 1_000_000, 2_000_000);
        }
        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.num_used_accounts, 10);
        for i in 0..10usize {
            assert!(engine.is_used(i));
            assert_eq!(engine.accounts[i].account_id, i as u64);
            assert!(engine.accounts[i].capital.is_zero());
        }
        assert_eq!(engine.insurance_fund.balance.get(), 10_000_000);
        // The vault token account mirrors the engine's trusted image.
        let tok = TokenAccount::unpack(&fx.vault.data).unwrap();
        assert_eq!(tok.amount, 10_000_000);
        assert_eq!(engine.vault.get(), 10_000_000);
    }

    #[test]
    fn deposit_and_withdraw_round_trip() {
        let mut fx = setup_market();
        let user_key = Pubkey::new_unique();
        init_user(&mut fx, user_key, 1_000_000, 10_000_000);
        deposit(&mut fx, user_key, 0, 5_000_000);
        {
            let engine = zc::engine_ref(&fx.slab.data).unwrap();
            assert_eq!(engine.accounts[0].capital.get(), 5_000_000);
            assert_eq!(engine.vault.get(), 6_000_000);
        }

        let mut user =
            TestAccount::new(user_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut ata = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(fx.mint_key, user_key, 0),
        )
        .writable();
        let mut pda = TestAccount::new(fx.vault_pda, Pubkey::default(), 0, vec![]);
        let mut token = TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]);
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(11, 1_001),
        );
        let mut pyth = TestAccount::new(
            Pubkey::new_unique(),
            Pubkey::default(),
            0,
            make_pyth(100_000_000, -6, 1, 1_001),
        );
        let data = encode_withdraw(0, 5_000_000);
        let infos = [
            user.to_info(),
            fx.slab.to_info(),
            fx.vault.to_info(),
            ata.to_info(),
            pda.to_info(),
            token.to_info(),
            clock.to_info(),
            pyth.to_info(),
        ];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
        let returned = TokenAccount::unpack(&ata.data).unwrap();
        assert_eq!(returned.amount, 5_000_000);

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert!(engine.accounts[0].capital.is_zero());
        assert_eq!(engine.vault.get(), 1_000_000);
    }

    #[test]
    fn trade_nocpi_moves_positions_symmetrically() {
        let mut fx = setup_market();
        let lp_key = Pubkey::new_unique();
        let user_key = Pubkey::new_unique();
        init_lp(&mut fx, lp_key, 1_000_000, 2_000_000);
        init_user(&mut fx, user_key, 1_000_000, 2_000_000);
        deposit(&mut fx, lp_key, 0, 1_000_000);
        deposit(&mut fx, user_key, 1, 1_000_000);

        let mut user =
            TestAccount::new(user_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut lp =
            TestAccount::new(lp_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(12, 1_002),
        );
        let mut pyth = TestAccount::new(
            Pubkey::new_unique(),
            Pubkey::default(),
            0,
            make_pyth(100_000_000, -6, 1, 1_002),
        );
        let data = encode_trade_nocpi(0, 1, 100);
        let infos = [
            user.to_info(),
            lp.to_info(),
            fx.slab.to_info(),
            clock.to_info(),
            pyth.to_info(),
        ];
        process_instruction(&fx.program_id, &infos, &data).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.accounts[1].position_size.get(), 100);
        assert_eq!(engine.accounts[0].position_size.get(), -100);
        assert_eq!(engine.total_open_interest.get(), 200);
        assert!(engine.check_conservation());
    }

    #[test]
    fn permissionless_crank_advances_clock() {
        let mut fx = setup_market();
        let mut caller =
            TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]);
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(42, 500),
        );
        let mut pyth = TestAccount::new(
            Pubkey::new_unique(),
            Pubkey::default(),
            0,
            make_pyth(100_000_000, -6, 1, 500),
        );
        let data = encode_crank(u16::MAX, 0);
        let infos = [caller.to_info(), fx.slab.to_info(), clock.to_info(), pyth.to_info()];
        process_instruction(&fx.program_id, &infos, &data).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.last_crank_slot, 42);
        assert_eq!(engine.last_full_sweep_start_slot, 42);
    }

    #[test]
    fn stale_oracle_rejected_one_second_past_bound() {
        let mut fx = setup_market();
        // max_staleness_secs = 60; publish at t=500.
        let run = |fx: &mut MarketFixture, now_ts: i64| -> Result<(), ProgramError> {
            let mut caller = TestAccount::new(
                Pubkey::new_unique(),
                solana_program::system_program::id(),
                0,
                vec![],
            );
            let mut clock = TestAccount::new(
                solana_program::sysvar::clock::id(),
                solana_program::sysvar::id(),
                0,
                make_clock(42, now_ts),
            );
            let mut pyth = TestAccount::new(
                Pubkey::new_unique(),
                Pubkey::default(),
                0,
                make_pyth(100_000_000, -6, 1, 500),
            );
            let data = encode_crank(u16::MAX, 0);
            let infos = [caller.to_info(), fx.slab.to_info(), clock.to_info(), pyth.to_info()];
            process_instruction(&fx.program_id, &infos, &data)
        };
        // Exactly at the bound: accepted.
        run(&mut fx, 560).unwrap();
        // One second past: rejected.
        assert_eq!(run(&mut fx, 561), Err(PercolatorError::OracleStale.into()));
    }

    #[test]
    fn wide_confidence_rejected() {
        let mut fx = setup_market();
        let mut caller =
            TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]);
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(42, 500),
        );
        // conf/price = 2%, filter is 1%.
        let mut pyth = TestAccount::new(
            Pubkey::new_unique(),
            Pubkey::default(),
            0,
            make_pyth(100_000_000, -6, 2_000_000, 500),
        );
        let data = encode_crank(u16::MAX, 0);
        let infos = [caller.to_info(), fx.slab.to_info(), clock.to_info(), pyth.to_info()];
        assert_eq!(
            process_instruction(&fx.program_id, &infos, &data),
            Err(PercolatorError::ConfidenceTooWide.into())
        );
    }

    #[test]
    fn admin_gate_on_threshold_and_admin_rotation() {
        let mut fx = setup_market();
        let stranger = Pubkey::new_unique();
        assert_eq!(
            run_admin_op(&mut fx, stranger, &encode_set_threshold(123)),
            Err(PercolatorError::NotAdmin.into())
        );

        let admin = fx.admin_key;
        run_admin_op(&mut fx, admin, &encode_set_threshold(123)).unwrap();
        {
            let engine = zc::engine_ref(&fx.slab.data).unwrap();
            assert_eq!(engine.risk_reduction_threshold(), 123);
        }

        // Rotate the admin; the old key loses the gate.
        let new_admin = Pubkey::new_unique();
        run_admin_op(&mut fx, admin, &encode_update_admin(&new_admin)).unwrap();
        assert_eq!(
            run_admin_op(&mut fx, admin, &encode_set_threshold(456)),
            Err(PercolatorError::NotAdmin.into())
        );
        run_admin_op(&mut fx, new_admin, &encode_set_threshold(456)).unwrap();
    }

    #[test]
    fn authority_price_push_rules() {
        let mut fx = setup_market();
        let authority = Pubkey::new_unique();

        // Pushing before an authority is configured fails.
        assert_eq!(
            run_admin_op(&mut fx, authority, &encode_push_price(5_000_000, 100)),
            Err(PercolatorError::NotOracleAuthority.into())
        );

        let admin = fx.admin_key;
        run_admin_op(&mut fx, admin, &encode_set_oracle_authority(&authority)).unwrap();

        // A zero price is invalid and leaves the stored price untouched.
        assert_eq!(
            run_admin_op(&mut fx, authority, &encode_push_price(0, 100)),
            Err(PercolatorError::OraclePriceInvalid.into())
        );
        {
            let engine = zc::engine_ref(&fx.slab.data).unwrap();
            assert_eq!(engine.authority_price_e6, 0);
        }

        // A future timestamp is accepted: the authority is trusted.
        run_admin_op(&mut fx, authority, &encode_push_price(5_000_000, i64::MAX)).unwrap();
        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.authority_price_e6, 5_000_000);
        assert_eq!(engine.authority_timestamp, i64::MAX);
    }

    #[test]
    fn authority_price_satisfies_the_gate_without_a_feed() {
        let mut fx = setup_market();
        let authority = Pubkey::new_unique();
        let admin = fx.admin_key;
        run_admin_op(&mut fx, admin, &encode_set_oracle_authority(&authority)).unwrap();
        run_admin_op(&mut fx, authority, &encode_push_price(77_000_000, 490)).unwrap();

        let mut caller =
            TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]);
        let mut clock = TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(42, 500),
        );
        let mut none = TestAccount::new(Pubkey::default(), Pubkey::default(), 0, vec![]);
        let data = encode_crank(u16::MAX, 0);
        let infos = [caller.to_info(), fx.slab.to_info(), clock.to_info(), none.to_info()];
        process_instruction(&fx.program_id, &infos, &data).unwrap();
        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.last_crank_slot, 42);
    }

    #[test]
    fn close_slab_requires_empty_market_and_drains_lamports() {
        let mut fx = setup_market();
        let admin = fx.admin_key;

        let mut admin_acc =
            TestAccount::new(admin, solana_program::system_program::id(), 10, vec![]).signer();
        let data = vec![13u8];
        {
            let infos = [admin_acc.to_info(), fx.slab.to_info()];
            process_instruction(&fx.program_id, &infos, &data).unwrap();
        }
        assert_eq!(admin_acc.lamports, 1_000_010);
        assert_eq!(fx.slab.lamports, 0);
        assert!(fx.slab.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn close_slab_with_funds_rejected() {
        let mut fx = setup_market();
        init_user(&mut fx, Pubkey::new_unique(), 1_000_000, 2_000_000);
        let admin = fx.admin_key;
        assert_eq!(
            run_admin_op(&mut fx, admin, &vec![13u8]),
            Err(PercolatorError::InsufficientCapital.into())
        );
    }
}
