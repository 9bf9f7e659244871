//! Slab-resident risk engine for a perpetual futures market.
//!
//! The engine is one contiguous, fixed-layout struct designed to live inside
//! a single program-owned account. It owns every market-critical rule:
//!
//! 1. Collateral conservation across deposits, trades, funding, liquidation
//!    and socialized loss.
//! 2. PnL warmup: freshly booked profit vests linearly before it can become
//!    withdrawable principal.
//! 3. Two-pass settlement: losses are always realized before profits convert,
//!    so the haircut ratio never reads a stale residual.
//! 4. Automatic recovery: once socialized losses exist and the book is flat,
//!    phantom profit claims are written off and stranded collateral is swept
//!    into the insurance fund.
//!
//! All multi-byte state is little-endian and 8-byte aligned; see `i128` for
//! the 128-bit limb wrappers that keep the layout target-independent.

#![no_std]
#![forbid(unsafe_code)]

// ============================================================================
// Constants
// ============================================================================

// MAX_ACCOUNTS is cfg-configured, not target-configured, so host and SBF
// builds of the same feature set agree on every slab offset.
#[cfg(kani)]
pub const MAX_ACCOUNTS: usize = 4;

#[cfg(all(any(test, feature = "test"), not(kani)))]
pub const MAX_ACCOUNTS: usize = 64;

#[cfg(all(not(any(test, feature = "test")), not(kani)))]
pub const MAX_ACCOUNTS: usize = 4096;

pub const BITMAP_WORDS: usize = (MAX_ACCOUNTS + 63) / 64;

/// Mask for wrapping crank cursors (MAX_ACCOUNTS must be a power of two).
const ACCOUNT_IDX_MASK: usize = MAX_ACCOUNTS - 1;
const _: () = assert!(MAX_ACCOUNTS.is_power_of_two());

/// Fixed byte stride of one account record inside the slab.
pub const ACCOUNT_STRIDE: usize = 248;

/// Occupied slots visited per crank call. Below this population a single
/// crank covers the whole book and completes a full sweep.
pub const ACCOUNTS_PER_CRANK: u16 = 256;

/// Liquidations performed per crank call (caps worst-case compute).
pub const LIQ_BUDGET_PER_CRANK: u16 = 120;

/// Forced position closes per crank call while in risk-reduction mode.
pub const FORCE_CLOSE_BUDGET_PER_CRANK: u16 = 32;

/// Counterparty legs a single forced close may touch.
pub const CLOSE_PAIR_BUDGET: usize = 4;

/// Price scale: all prices carry six implicit decimals (Q6).
pub const PRICE_SCALE: u128 = 1_000_000;

/// Basis-point denominator.
pub const BPS_DENOM: u128 = 10_000;

/// Upper bound on accepted oracle prices; prevents overflow in PnL math.
pub const MAX_ORACLE_PRICE: u64 = 1_000_000_000_000_000;

/// Upper bound on absolute position size. Together with MAX_ORACLE_PRICE the
/// product fits i128 with room to spare.
pub const MAX_POSITION_ABS: u128 = 100_000_000_000_000_000_000;

/// Conservation slack allowance: one unit of rounding per live account.
pub const MAX_ROUNDING_SLACK: u128 = MAX_ACCOUNTS as u128;

pub mod i128;
pub use i128::{I128, U128};

use core::cmp::min;

// ============================================================================
// Core data structures
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountKind {
    User = 0,
    LP = 1,
}

/// One slab record. Users and LPs share the layout; LPs carry a matcher
/// program/context and serve as trade counterparties.
///
/// The byte layout is frozen: 248 bytes, fields at fixed offsets, verified by
/// the const assertion below. New fields go into the reserved tail.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Account {
    /// Monotonic, never recycled.
    pub account_id: u64,
    pub kind: AccountKind,
    _pad0: [u8; 7],
    /// Principal authorized to sign for this account.
    pub owner: [u8; 32],
    /// Withdrawable collateral. Never driven negative.
    pub capital: U128,
    /// Realized PnL. Positive values vest through warmup; negative values
    /// are charged against capital at the next settlement point.
    pub pnl_realized: I128,
    /// Warmed positive PnL, convertible to capital at the haircut ratio.
    pub pnl_reserved: U128,
    pub warmup_started_at_slot: u64,
    /// Linear vesting rate, units per slot.
    pub warmup_slope_per_step: U128,
    /// Signed position in base units (+ long, - short).
    pub position_size: I128,
    /// Notional-weighted average entry price (Q6).
    pub entry_price: u64,
    /// Global funding index at this account's last funding settlement.
    pub funding_index_snapshot: I128,
    /// Maintenance-fee bookkeeping. Negative = fees owed; forgiven at close.
    pub fee_credits: I128,
    /// Matching engine program id (zero for users).
    pub matcher_program: [u8; 32],
    /// Matching engine context account (zero for users).
    pub matcher_context: [u8; 32],
    _reserved: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<Account>() == ACCOUNT_STRIDE);
const _: () = assert!(core::mem::align_of::<Account>() == 8);

impl Account {
    pub fn is_lp(&self) -> bool {
        matches!(self.kind, AccountKind::LP)
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, AccountKind::User)
    }
}

fn empty_account() -> Account {
    Account {
        account_id: 0,
        kind: AccountKind::User,
        _pad0: [0; 7],
        owner: [0; 32],
        capital: U128::ZERO,
        pnl_realized: I128::ZERO,
        pnl_reserved: U128::ZERO,
        warmup_started_at_slot: 0,
        warmup_slope_per_step: U128::ZERO,
        position_size: I128::ZERO,
        entry_price: 0,
        funding_index_snapshot: I128::ZERO,
        fee_credits: I128::ZERO,
        matcher_program: [0; 32],
        matcher_context: [0; 32],
        _reserved: [0; 8],
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsuranceFund {
    pub balance: U128,
    /// Lifetime fee intake (telemetry, never spent from).
    pub fee_revenue: U128,
}

/// Funding configuration. Not part of the 144-byte wire params; populated
/// from deployment defaults at market init.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FundingParams {
    /// Premium amortization horizon in slots.
    pub horizon_slots: u64,
    /// Premium multiplier in bps.
    pub k_bps: u64,
    /// Premium cap in bps.
    pub max_premium_bps: u64,
    /// Per-slot rate cap in bps.
    pub max_bps_per_slot: u64,
    /// Notional (e6) that maps LP inventory to one k_bps of premium.
    pub scale_notional_e6: U128,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiskParams {
    /// Vesting period for positive PnL, in slots.
    pub warmup_period_slots: u64,
    /// Must be strictly below initial_margin_bps.
    pub maintenance_margin_bps: u64,
    pub initial_margin_bps: u64,
    pub trading_fee_bps: u64,
    /// Runtime account cap; must not exceed the compiled MAX_ACCOUNTS.
    pub max_accounts: u64,
    /// Flat account creation fee, paid into insurance.
    pub new_account_fee: U128,
    /// Insurance floor below which risk-reduction-only mode engages.
    pub risk_reduction_threshold: U128,
    pub maintenance_fee_per_slot: U128,
    /// Staleness bound on the crank sweep; u64::MAX disables the gate.
    pub max_crank_staleness_slots: u64,
    pub liquidation_fee_bps: u64,
    pub liquidation_fee_cap: U128,
    /// Buffer above maintenance targeted after a partial liquidation.
    pub liquidation_buffer_bps: u64,
    /// Positions left below this size are closed in full.
    pub min_liquidation_abs: U128,
    pub funding: FundingParams,
}

/// The slab-resident engine. Field order is the physical layout: params,
/// engine scalars, O(1) aggregates, cursors, bitmap, account records.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskEngine {
    pub params: RiskParams,

    pub current_slot: u64,
    pub last_crank_slot: u64,
    pub last_full_sweep_start_slot: u64,
    pub last_funding_slot: u64,
    /// Cumulative funding, quote per base unit, e6 scale.
    pub funding_index_qp_e6: I128,

    pub insurance_fund: InsuranceFund,
    /// Trusted internal image of the external vault balance.
    pub vault: U128,
    /// Socialized loss not yet retired by haircuts or top-ups. Never
    /// negative; stored signed to match the wire layout.
    pub loss_accum: I128,

    // O(1) aggregates, maintained by the setter helpers below.
    /// Sum of capital over used accounts.
    pub c_tot: U128,
    /// Sum of positive realized PnL plus reserved PnL.
    pub pnl_pos_tot: U128,
    /// Sum of |negative realized PnL|.
    pub pnl_neg_tot: U128,
    /// Sum of |position| over all used accounts.
    pub total_open_interest: U128,
    /// Sum of |position| over LP accounts.
    pub lp_sum_abs: U128,
    /// Max |position| over LP accounts (monotone; re-grounded per sweep).
    pub lp_max_abs: U128,
    /// In-progress max for the current sweep.
    pub lp_max_abs_sweep: U128,
    /// Signed LP inventory, drives the funding premium.
    pub net_lp_pos: I128,

    /// Admin-pushed price override (0 = none). Trusted surface.
    pub authority_price_e6: u64,
    pub authority_timestamp: i64,

    pub next_account_id: u64,
    pub lifetime_liquidations: u64,
    pub lifetime_force_closes: u64,

    pub num_used_accounts: u16,
    pub crank_cursor: u16,
    pub sweep_start_idx: u16,
    pub risk_reduction_only: u8,
    pub warmup_paused: u8,

    /// Occupancy bitmap: the sole account index.
    pub used: [u64; BITMAP_WORDS],
    pub accounts: [Account; MAX_ACCOUNTS],
}

const _: () = assert!(core::mem::align_of::<RiskEngine>() == 8);

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskError {
    InvalidIndex,
    MarketFull,
    DuplicateOwner,
    ZeroSize,
    AccountKindMismatch,
    ArithmeticOverflow,
    DivisionByZero,
    StaleCrank,
    RiskReductionOnly,
    InsufficientMargin,
    InsufficientCapital,
    InsufficientInsurance,
    PnlNotWarmedUp,
    PositionOpen,
    OraclePriceInvalid,
    MatcherRejected,
    MatcherReturnedBadPrice,
    AccountHealthy,
    LiquidationTooSmall,
}

pub type Result<T> = core::result::Result<T, RiskError>;

/// What a keeper crank did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrankOutcome {
    /// Whether last_crank_slot moved forward.
    pub advanced: bool,
    /// Whether this crank completed a full sweep of the book.
    pub sweep_complete: bool,
    /// Index where the next crank resumes.
    pub last_cursor: u16,
    pub num_liquidations: u32,
    /// Forced closes performed in risk-reduction mode.
    pub num_force_closes: u16,
    /// Per-account errors skipped (allow_panic off).
    pub num_errors: u16,
    /// Whether stranded-funds recovery fired.
    pub recovered: bool,
}

// ============================================================================
// Math helpers
// ============================================================================

/// Saturating |x| that tolerates i128::MIN.
#[inline]
fn sat_abs_i128(val: i128) -> i128 {
    if val == i128::MIN {
        i128::MAX
    } else {
        val.abs()
    }
}

/// Magnitude of a negative i128, tolerating i128::MIN.
#[inline]
fn neg_i128_to_u128(val: i128) -> u128 {
    debug_assert!(val < 0);
    if val == i128::MIN {
        (i128::MAX as u128) + 1
    } else {
        (-val) as u128
    }
}

/// u128 -> i128 clamped at i128::MAX instead of wrapping.
#[inline]
fn u128_to_i128_clamped(x: u128) -> i128 {
    if x > i128::MAX as u128 {
        i128::MAX
    } else {
        x as i128
    }
}

/// PnL of closing `abs_units` of a position at `fill` against `entry`.
/// Truncates toward zero (signed division).
fn mark_slice(long: bool, entry: u64, fill: u64, abs_units: u128) -> Result<i128> {
    if abs_units == 0 {
        return Ok(0);
    }
    let diff: i128 = if long {
        (fill as i128) - (entry as i128)
    } else {
        (entry as i128) - (fill as i128)
    };
    diff.checked_mul(u128_to_i128_clamped(abs_units))
        .ok_or(RiskError::ArithmeticOverflow)?
        .checked_div(PRICE_SCALE as i128)
        .ok_or(RiskError::DivisionByZero)
}

// ============================================================================
// Matching engine boundary
// ============================================================================

/// A fill reported by the matching engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TradeExecution {
    pub price: u64,
    pub size: i128,
}

/// Pluggable matching engine. The wrapper routes this through a CPI into the
/// LP's matcher program; the engine only sees the resulting fill.
///
/// The matcher must not be able to reenter the engine: the host enforces an
/// exclusive borrow on the slab for the whole operation.
pub trait MatchingEngine {
    fn execute_match(
        &self,
        lp_program: &[u8; 32],
        lp_context: &[u8; 32],
        lp_account_id: u64,
        oracle_price: u64,
        size: i128,
    ) -> Result<TradeExecution>;
}

/// Fills at the oracle price for the requested size. Test matcher.
pub struct NoOpMatcher;

impl MatchingEngine for NoOpMatcher {
    fn execute_match(
        &self,
        _lp_program: &[u8; 32],
        _lp_context: &[u8; 32],
        _lp_account_id: u64,
        oracle_price: u64,
        size: i128,
    ) -> Result<TradeExecution> {
        Ok(TradeExecution {
            price: oracle_price,
            size,
        })
    }
}

// ============================================================================
// Engine implementation
// ============================================================================

impl RiskEngine {
    /// Stack-constructs the full engine. Host/test use only; BPF code must
    /// zero the slab and call `init_in_place`.
    pub fn new(params: RiskParams) -> Self {
        Self {
            params,
            current_slot: 0,
            last_crank_slot: 0,
            last_full_sweep_start_slot: 0,
            last_funding_slot: 0,
            funding_index_qp_e6: I128::ZERO,
            insurance_fund: InsuranceFund {
                balance: U128::ZERO,
                fee_revenue: U128::ZERO,
            },
            vault: U128::ZERO,
            loss_accum: I128::ZERO,
            c_tot: U128::ZERO,
            pnl_pos_tot: U128::ZERO,
            pnl_neg_tot: U128::ZERO,
            total_open_interest: U128::ZERO,
            lp_sum_abs: U128::ZERO,
            lp_max_abs: U128::ZERO,
            lp_max_abs_sweep: U128::ZERO,
            net_lp_pos: I128::ZERO,
            authority_price_e6: 0,
            authority_timestamp: 0,
            next_account_id: 0,
            lifetime_liquidations: 0,
            lifetime_force_closes: 0,
            num_used_accounts: 0,
            crank_cursor: 0,
            sweep_start_idx: 0,
            risk_reduction_only: 0,
            warmup_paused: 0,
            used: [0; BITMAP_WORDS],
            accounts: [empty_account(); MAX_ACCOUNTS],
        }
    }

    /// Initializes an engine whose backing memory is already zeroed.
    /// Every zero field of the fresh state is meaningful (empty bitmap,
    /// id counter at 0, no funds), so only params need writing.
    pub fn init_in_place(&mut self, params: RiskParams) {
        self.params = params;
    }

    // ========================================
    // Bitmap
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= MAX_ACCOUNTS {
            return false;
        }
        (self.used[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn set_used(&mut self, idx: usize) {
        self.used[idx >> 6] |= 1u64 << (idx & 63);
    }

    fn clear_used(&mut self, idx: usize) {
        self.used[idx >> 6] &= !(1u64 << (idx & 63));
    }

    fn for_each_used<F: FnMut(usize, &Account)>(&self, mut f: F) {
        for (block, word) in self.used.iter().copied().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                let idx = block * 64 + bit;
                if idx < MAX_ACCOUNTS {
                    f(idx, &self.accounts[idx]);
                }
            }
        }
    }

    /// First-fit slot allocation. The bitmap is the sole index; ids are
    /// minted monotonically and never reused.
    fn alloc_slot(&mut self) -> Result<u16> {
        for block in 0..BITMAP_WORDS {
            let word = self.used[block];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                let idx = block * 64 + bit;
                if idx >= MAX_ACCOUNTS {
                    break;
                }
                self.set_used(idx);
                self.num_used_accounts = self.num_used_accounts.saturating_add(1);
                return Ok(idx as u16);
            }
        }
        Err(RiskError::MarketFull)
    }

    fn free_slot(&mut self, idx: u16) {
        self.accounts[idx as usize] = empty_account();
        self.clear_used(idx as usize);
        self.num_used_accounts = self.num_used_accounts.saturating_sub(1);
    }

    // ========================================
    // Aggregate setters
    // ========================================
    // Every mutation of capital / realized PnL / reserved PnL goes through
    // these so c_tot, pnl_pos_tot and pnl_neg_tot stay O(1)-consistent.

    #[inline]
    fn set_capital(&mut self, idx: usize, new_capital: u128) {
        let old = self.accounts[idx].capital.get();
        let c = self.c_tot.get();
        self.c_tot = U128::new(if new_capital >= old {
            c.saturating_add(new_capital - old)
        } else {
            c.saturating_sub(old - new_capital)
        });
        self.accounts[idx].capital = U128::new(new_capital);
    }

    #[inline]
    fn set_pnl(&mut self, idx: usize, new_pnl: i128) {
        let old = self.accounts[idx].pnl_realized.get();
        let old_pos = if old > 0 { old as u128 } else { 0 };
        let new_pos = if new_pnl > 0 { new_pnl as u128 } else { 0 };
        let old_neg = if old < 0 { neg_i128_to_u128(old) } else { 0 };
        let new_neg = if new_pnl < 0 { neg_i128_to_u128(new_pnl) } else { 0 };
        self.pnl_pos_tot = U128::new(
            self.pnl_pos_tot
                .get()
                .saturating_add(new_pos)
                .saturating_sub(old_pos),
        );
        self.pnl_neg_tot = U128::new(
            self.pnl_neg_tot
                .get()
                .saturating_add(new_neg)
                .saturating_sub(old_neg),
        );
        self.accounts[idx].pnl_realized = I128::new(new_pnl);
    }

    #[inline]
    fn set_reserved(&mut self, idx: usize, new_reserved: u128) {
        let old = self.accounts[idx].pnl_reserved.get();
        let p = self.pnl_pos_tot.get();
        self.pnl_pos_tot = U128::new(if new_reserved >= old {
            p.saturating_add(new_reserved - old)
        } else {
            p.saturating_sub(old - new_reserved)
        });
        self.accounts[idx].pnl_reserved = U128::new(new_reserved);
    }

    /// Rebuild the aggregates from the records. Test helper for direct
    /// state surgery.
    pub fn recompute_aggregates(&mut self) {
        let mut c_tot = 0u128;
        let mut pos = 0u128;
        let mut neg = 0u128;
        let mut oi = 0u128;
        let mut lp_sum = 0u128;
        let mut lp_max = 0u128;
        let mut lp_net = 0i128;
        self.for_each_used(|_idx, a| {
            c_tot = c_tot.saturating_add(a.capital.get());
            let pnl = a.pnl_realized.get();
            if pnl > 0 {
                pos = pos.saturating_add(pnl as u128);
            } else if pnl < 0 {
                neg = neg.saturating_add(neg_i128_to_u128(pnl));
            }
            pos = pos.saturating_add(a.pnl_reserved.get());
            let abs = a.position_size.unsigned_abs();
            oi = oi.saturating_add(abs);
            if a.is_lp() {
                lp_sum = lp_sum.saturating_add(abs);
                lp_max = lp_max.max(abs);
                lp_net = lp_net.saturating_add(a.position_size.get());
            }
        });
        self.c_tot = U128::new(c_tot);
        self.pnl_pos_tot = U128::new(pos);
        self.pnl_neg_tot = U128::new(neg);
        self.total_open_interest = U128::new(oi);
        self.lp_sum_abs = U128::new(lp_sum);
        self.lp_max_abs = U128::new(lp_max);
        self.net_lp_pos = I128::new(lp_net);
    }

    // ========================================
    // Haircut
    // ========================================

    /// Collateral available to back positive PnL conversion.
    #[inline]
    pub fn residual(&self) -> u128 {
        self.vault
            .get()
            .saturating_sub(self.c_tot.get())
            .saturating_sub(self.insurance_fund.balance.get())
    }

    /// h = min(residual, pnl_pos_tot) / pnl_pos_tot, as (num, den).
    /// (1, 1) when there are no positive claims.
    #[inline]
    pub fn haircut_ratio(&self) -> (u128, u128) {
        let claims = self.pnl_pos_tot.get();
        if claims == 0 {
            return (1, 1);
        }
        (min(self.residual(), claims), claims)
    }

    // ========================================
    // Account management
    // ========================================

    fn owner_in_use(&self, owner: &[u8; 32]) -> bool {
        let mut found = false;
        self.for_each_used(|_idx, a| {
            if &a.owner == owner {
                found = true;
            }
        });
        found
    }

    fn create_account(
        &mut self,
        kind: AccountKind,
        owner: [u8; 32],
        matcher_program: [u8; 32],
        matcher_context: [u8; 32],
        fee_payment: u128,
    ) -> Result<u16> {
        if self.num_used_accounts as u64 >= self.params.max_accounts {
            return Err(RiskError::MarketFull);
        }
        let required = self.params.new_account_fee.get();
        if fee_payment < required {
            return Err(RiskError::InsufficientCapital);
        }
        if owner != [0; 32] && self.owner_in_use(&owner) {
            return Err(RiskError::DuplicateOwner);
        }

        // Fee tokens land in the vault; the required part is insurance
        // revenue, the excess is the account's opening capital.
        let excess = fee_payment - required;
        self.vault = U128::new(self.vault.get().saturating_add(fee_payment));
        self.insurance_fund.balance =
            U128::new(self.insurance_fund.balance.get().saturating_add(required));
        self.insurance_fund.fee_revenue =
            U128::new(self.insurance_fund.fee_revenue.get().saturating_add(required));

        let idx = self.alloc_slot()?;
        let account_id = self.next_account_id;
        self.next_account_id = self.next_account_id.saturating_add(1);

        self.accounts[idx as usize] = Account {
            account_id,
            kind,
            _pad0: [0; 7],
            owner,
            capital: U128::ZERO,
            pnl_realized: I128::ZERO,
            pnl_reserved: U128::ZERO,
            warmup_started_at_slot: self.current_slot,
            warmup_slope_per_step: U128::ZERO,
            position_size: I128::ZERO,
            entry_price: 0,
            funding_index_snapshot: self.funding_index_qp_e6,
            fee_credits: I128::ZERO,
            matcher_program,
            matcher_context,
            _reserved: [0; 8],
        };
        if excess > 0 {
            self.set_capital(idx as usize, excess);
        }
        Ok(idx)
    }

    pub fn add_user(&mut self, owner: [u8; 32], fee_payment: u128) -> Result<u16> {
        self.create_account(AccountKind::User, owner, [0; 32], [0; 32], fee_payment)
    }

    pub fn add_lp(
        &mut self,
        owner: [u8; 32],
        matcher_program: [u8; 32],
        matcher_context: [u8; 32],
        fee_payment: u128,
    ) -> Result<u16> {
        self.create_account(
            AccountKind::LP,
            owner,
            matcher_program,
            matcher_context,
            fee_payment,
        )
    }

    fn require_used(&self, idx: u16) -> Result<()> {
        if (idx as usize) >= MAX_ACCOUNTS || !self.is_used(idx as usize) {
            return Err(RiskError::InvalidIndex);
        }
        Ok(())
    }

    // ========================================
    // Funding
    // ========================================

    /// Inventory-premium funding rate in bps per slot. Sign follows LP
    /// inventory so the rate pushes net LP exposure toward zero.
    pub fn funding_rate_bps_per_slot(&self, price_e6: u64) -> i64 {
        let f = &self.params.funding;
        let net = self.net_lp_pos.get();
        if net == 0 || price_e6 == 0 || f.horizon_slots == 0 {
            return 0;
        }
        let notional_e6 = net
            .unsigned_abs()
            .saturating_mul(price_e6 as u128)
            / PRICE_SCALE;
        let scale = f.scale_notional_e6.get().max(1);
        let mut premium = notional_e6.saturating_mul(f.k_bps as u128) / scale;
        if premium > f.max_premium_bps as u128 {
            premium = f.max_premium_bps as u128;
        }
        // Hard sanity bound before the configured cap: a premium beyond
        // 100% per interval means broken params, not a real rate.
        if premium > BPS_DENOM {
            premium = BPS_DENOM;
        }
        let signed: i64 = if net > 0 {
            premium as i64
        } else {
            -(premium as i64)
        };
        let mut per_slot = signed / f.horizon_slots as i64;
        let cap = (f.max_bps_per_slot as i64).min(BPS_DENOM as i64);
        per_slot = per_slot.clamp(-cap, cap);
        per_slot
    }

    /// Advance the global funding index. Runs only from the crank (the
    /// funding index must not move between cranks).
    fn accrue_funding(&mut self, now_slot: u64, price_e6: u64) -> Result<()> {
        let mut dt = now_slot.saturating_sub(self.last_funding_slot);
        if dt == 0 {
            return Ok(());
        }
        let horizon = self.params.funding.horizon_slots;
        if horizon > 0 && dt > horizon {
            dt = horizon;
        }
        let rate = self.funding_rate_bps_per_slot(price_e6);
        if rate != 0 {
            // delta_index = price * rate_bps * dt / 10_000  (quote-per-base e6)
            let delta = (price_e6 as i128)
                .checked_mul(rate as i128)
                .ok_or(RiskError::ArithmeticOverflow)?
                .checked_mul(dt as i128)
                .ok_or(RiskError::ArithmeticOverflow)?
                / BPS_DENOM as i128;
            let idx = self
                .funding_index_qp_e6
                .get()
                .checked_add(delta)
                .ok_or(RiskError::ArithmeticOverflow)?;
            self.funding_index_qp_e6 = I128::new(idx);
        }
        self.last_funding_slot = now_slot;
        Ok(())
    }

    /// Settle the funding leg into realized PnL. Payments round up, receipts
    /// truncate, so the vault never owes more than it holds.
    fn settle_funding(&mut self, idx: u16) -> Result<()> {
        self.require_used(idx)?;
        let global = self.funding_index_qp_e6;
        let a = &self.accounts[idx as usize];
        let delta_f = global
            .get()
            .checked_sub(a.funding_index_snapshot.get())
            .ok_or(RiskError::ArithmeticOverflow)?;
        if delta_f != 0 && !a.position_size.is_zero() {
            let raw = a
                .position_size
                .get()
                .checked_mul(delta_f)
                .ok_or(RiskError::ArithmeticOverflow)?;
            let payment = if raw > 0 {
                (raw
                    .checked_add(PRICE_SCALE as i128 - 1)
                    .ok_or(RiskError::ArithmeticOverflow)?)
                    / PRICE_SCALE as i128
            } else {
                raw / PRICE_SCALE as i128
            };
            let new_pnl = self.accounts[idx as usize]
                .pnl_realized
                .get()
                .checked_sub(payment)
                .ok_or(RiskError::ArithmeticOverflow)?;
            self.set_pnl(idx as usize, new_pnl);
        }
        self.accounts[idx as usize].funding_index_snapshot = global;
        Ok(())
    }

    // ========================================
    // Warmup
    // ========================================

    /// Vest warmed positive PnL into the reserved bucket. No-op while
    /// warmup is paused.
    fn advance_warmup(&mut self, idx: u16) {
        if self.warmup_paused != 0 {
            return;
        }
        let a = &self.accounts[idx as usize];
        let pnl = a.pnl_realized.get();
        let avail = if pnl > 0 { pnl as u128 } else { 0 };
        if avail > 0 {
            let elapsed = self.current_slot.saturating_sub(a.warmup_started_at_slot);
            let cap = a.warmup_slope_per_step.get().saturating_mul(elapsed as u128);
            let vest = min(avail, cap);
            if vest > 0 {
                self.set_pnl(idx as usize, pnl - vest as i128);
                let r = self.accounts[idx as usize].pnl_reserved.get();
                self.set_reserved(idx as usize, r.saturating_add(vest));
            }
        }
        self.accounts[idx as usize].warmup_started_at_slot = self.current_slot;
        self.refresh_warmup_slope(idx);
    }

    /// Recompute the vesting slope from the outstanding positive PnL.
    /// Slope is at least 1 whenever anything is vesting, so warmup cannot
    /// stall at zero forever.
    fn refresh_warmup_slope(&mut self, idx: u16) {
        let pnl = self.accounts[idx as usize].pnl_realized.get();
        let avail = if pnl > 0 { pnl as u128 } else { 0 };
        let period = self.params.warmup_period_slots;
        let slope = if avail == 0 {
            0
        } else if period > 0 {
            (avail / period as u128).max(1)
        } else {
            avail
        };
        self.accounts[idx as usize].warmup_slope_per_step = U128::new(slope);
    }

    /// Restart the vesting clock after new profit was booked.
    fn restart_warmup(&mut self, idx: u16) {
        self.accounts[idx as usize].warmup_started_at_slot = self.current_slot;
        self.refresh_warmup_slope(idx);
    }

    // ========================================
    // Two-pass settlement
    // ========================================

    /// Pass A: realize losses. Negative PnL pays from reserved profit, then
    /// capital; the uncovered remainder charges insurance and finally
    /// accrues to the socialized-loss accumulator.
    pub fn settle_losses(&mut self, idx: u16) -> Result<()> {
        self.require_used(idx)?;
        let pnl = self.accounts[idx as usize].pnl_realized.get();
        if pnl >= 0 {
            return Ok(());
        }
        let mut need = neg_i128_to_u128(pnl);

        let reserved = self.accounts[idx as usize].pnl_reserved.get();
        let from_reserved = min(need, reserved);
        if from_reserved > 0 {
            self.set_reserved(idx as usize, reserved - from_reserved);
            need -= from_reserved;
        }

        let capital = self.accounts[idx as usize].capital.get();
        let from_capital = min(need, capital);
        if from_capital > 0 {
            self.set_capital(idx as usize, capital - from_capital);
            need -= from_capital;
        }

        if need > 0 {
            // Bad debt: insurance first, then socialize the rest.
            let bal = self.insurance_fund.balance.get();
            let from_insurance = min(need, bal);
            self.insurance_fund.balance = U128::new(bal - from_insurance);
            need -= from_insurance;
            if need > 0 {
                let la = self
                    .loss_accum
                    .get()
                    .saturating_add(u128_to_i128_clamped(need));
                self.loss_accum = I128::new(la);
                self.enter_risk_reduction();
            }
        }
        self.set_pnl(idx as usize, 0);
        Ok(())
    }

    /// Pass B: convert the warmed reserve to capital at the current haircut.
    /// The destroyed share retires socialized loss.
    pub fn convert_reserved(&mut self, idx: u16) -> Result<()> {
        self.require_used(idx)?;
        let x = self.accounts[idx as usize].pnl_reserved.get();
        if x == 0 {
            return Ok(());
        }
        let (h_num, h_den) = self.haircut_ratio();
        let y = if h_den == 0 {
            x
        } else {
            x.saturating_mul(h_num) / h_den
        };
        self.set_reserved(idx as usize, 0);
        let cap = self.accounts[idx as usize].capital.get();
        self.set_capital(idx as usize, cap.saturating_add(y));
        let destroyed = x - y;
        if destroyed > 0 {
            let la = self.loss_accum.get();
            let retired = min(la, u128_to_i128_clamped(destroyed));
            self.loss_accum = I128::new(la - retired);
        }
        Ok(())
    }

    // ========================================
    // Risk-reduction mode
    // ========================================

    fn enter_risk_reduction(&mut self) {
        self.risk_reduction_only = 1;
        self.warmup_paused = 1;
    }

    fn exit_risk_reduction_if_safe(&mut self) {
        if self.loss_accum.get() <= 0
            && self.insurance_fund.balance.get() >= self.params.risk_reduction_threshold.get()
        {
            self.risk_reduction_only = 0;
            self.warmup_paused = 0;
        }
    }

    // ========================================
    // Position fills
    // ========================================

    /// Apply a signed fill to one account: weighted-average entry on
    /// increase, slice realization on reduction, full realization plus entry
    /// reset when the position crosses zero. Maintains OI and LP aggregates.
    /// Returns the realized PnL delta.
    fn apply_fill(&mut self, idx: usize, delta: i128, fill_price: u64) -> Result<i128> {
        if delta == 0 {
            return Ok(0);
        }
        let old_pos = self.accounts[idx].position_size.get();
        let old_entry = self.accounts[idx].entry_price;
        let new_pos = old_pos
            .checked_add(delta)
            .ok_or(RiskError::ArithmeticOverflow)?;
        let old_abs = old_pos.unsigned_abs();
        let new_abs = new_pos.unsigned_abs();
        if new_abs > MAX_POSITION_ABS {
            return Err(RiskError::ArithmeticOverflow);
        }
        let crosses = (old_pos > 0 && new_pos < 0) || (old_pos < 0 && new_pos > 0);

        let mut realized: i128 = 0;
        let mut new_entry = old_entry;
        if old_pos == 0 {
            new_entry = fill_price;
        } else if crosses {
            realized = mark_slice(old_pos > 0, old_entry, fill_price, old_abs)?;
            new_entry = fill_price;
        } else if new_abs > old_abs {
            // Same-direction increase: notional-weighted entry.
            let add_abs = delta.unsigned_abs();
            let weighted = old_abs
                .checked_mul(old_entry as u128)
                .and_then(|a| {
                    add_abs
                        .checked_mul(fill_price as u128)
                        .and_then(|b| a.checked_add(b))
                })
                .ok_or(RiskError::ArithmeticOverflow)?;
            new_entry = (weighted / new_abs) as u64;
        } else {
            // Reduction toward zero: realize the closed slice at the fill.
            let closed_abs = old_abs - new_abs;
            realized = mark_slice(old_pos > 0, old_entry, fill_price, closed_abs)?;
            if new_pos == 0 {
                new_entry = fill_price;
            }
        }

        if realized != 0 {
            let pnl = self.accounts[idx]
                .pnl_realized
                .get()
                .checked_add(realized)
                .ok_or(RiskError::ArithmeticOverflow)?;
            self.set_pnl(idx, pnl);
        }
        self.accounts[idx].position_size = I128::new(new_pos);
        self.accounts[idx].entry_price = new_entry;

        let oi = self.total_open_interest.get();
        self.total_open_interest = U128::new(if new_abs >= old_abs {
            oi.saturating_add(new_abs - old_abs)
        } else {
            oi.saturating_sub(old_abs - new_abs)
        });

        if self.accounts[idx].is_lp() {
            self.net_lp_pos = I128::new(
                self.net_lp_pos
                    .get()
                    .saturating_sub(old_pos)
                    .saturating_add(new_pos),
            );
            let s = self.lp_sum_abs.get();
            self.lp_sum_abs = U128::new(if new_abs >= old_abs {
                s.saturating_add(new_abs - old_abs)
            } else {
                s.saturating_sub(old_abs - new_abs)
            });
            self.lp_max_abs = U128::new(self.lp_max_abs.get().max(new_abs));
        }
        Ok(realized)
    }

    // ========================================
    // Margin
    // ========================================

    /// Unrealized PnL of the open position at `mark`.
    pub fn unrealized_pnl(account: &Account, mark: u64) -> Result<i128> {
        let pos = account.position_size.get();
        if pos == 0 {
            return Ok(0);
        }
        mark_slice(pos > 0, account.entry_price, mark, pos.unsigned_abs())
    }

    /// Effective equity: capital + reserved + unrealized + negative realized
    /// PnL, minus outstanding fee debt. Positive realized PnL counts only
    /// once warmed into the reserve. Overflow degrades to zero so a broken
    /// record can always be liquidated.
    pub fn effective_equity(&self, account: &Account, mark: u64) -> u128 {
        let unrealized = match Self::unrealized_pnl(account, mark) {
            Ok(u) => u,
            Err(_) => return 0,
        };
        let mut eq = u128_to_i128_clamped(account.capital.get())
            .saturating_add(u128_to_i128_clamped(account.pnl_reserved.get()))
            .saturating_add(min(account.pnl_realized.get(), 0))
            .saturating_add(unrealized);
        if account.fee_credits.is_negative() {
            let debt = neg_i128_to_u128(account.fee_credits.get());
            eq = eq.saturating_sub(u128_to_i128_clamped(debt));
        }
        if eq > 0 {
            eq as u128
        } else {
            0
        }
    }

    /// Margin requirement: ceil(|p| * mark / 1e6 * bps / 10_000).
    /// Ceiling so a requirement is never rounded away.
    pub fn margin_required(position_abs: u128, mark: u64, bps: u64) -> u128 {
        let notional = position_abs.saturating_mul(mark as u128) / PRICE_SCALE;
        if notional == 0 || bps == 0 {
            return 0;
        }
        (notional.saturating_mul(bps as u128) + (BPS_DENOM - 1)) / BPS_DENOM
    }

    fn meets_margin(&self, idx: u16, mark: u64, bps: u64) -> bool {
        let a = &self.accounts[idx as usize];
        let eq = self.effective_equity(a, mark);
        let req = Self::margin_required(a.position_size.unsigned_abs(), mark, bps);
        eq >= req
    }

    // ========================================
    // Deposits / withdrawals / close
    // ========================================

    pub fn deposit(&mut self, idx: u16, amount: u128, now_slot: u64) -> Result<()> {
        self.current_slot = now_slot;
        self.require_used(idx)?;

        self.vault = U128::new(self.vault.get().saturating_add(amount));

        // Outstanding fee debt is paid out of the deposit first.
        let mut remaining = amount;
        let credits = self.accounts[idx as usize].fee_credits;
        if credits.is_negative() {
            let owed = neg_i128_to_u128(credits.get());
            let pay = min(owed, remaining);
            remaining -= pay;
            self.insurance_fund.balance =
                U128::new(self.insurance_fund.balance.get().saturating_add(pay));
            self.insurance_fund.fee_revenue =
                U128::new(self.insurance_fund.fee_revenue.get().saturating_add(pay));
            self.accounts[idx as usize].fee_credits =
                I128::new(credits.get().saturating_add(u128_to_i128_clamped(pay)));
        }
        let cap = self.accounts[idx as usize].capital.get();
        self.set_capital(idx as usize, cap.saturating_add(remaining));

        self.settle_funding(idx)?;
        self.advance_warmup(idx);
        self.settle_losses(idx)?;
        self.convert_reserved(idx)?;
        Ok(())
    }

    pub fn withdraw(&mut self, idx: u16, amount: u128, now_slot: u64, oracle_price: u64) -> Result<()> {
        self.current_slot = now_slot;
        if oracle_price == 0 || oracle_price > MAX_ORACLE_PRICE {
            return Err(RiskError::OraclePriceInvalid);
        }
        self.require_fresh_sweep(now_slot)?;
        self.require_used(idx)?;

        self.settle_funding(idx)?;
        self.advance_warmup(idx);
        self.settle_losses(idx)?;
        self.convert_reserved(idx)?;

        let capital = self.accounts[idx as usize].capital.get();
        if capital < amount {
            return Err(RiskError::InsufficientCapital);
        }

        // Post-withdraw equity must clear initial margin at the oracle mark.
        if !self.accounts[idx as usize].position_size.is_zero() {
            let a = &self.accounts[idx as usize];
            let eq_after = self.effective_equity(a, oracle_price).saturating_sub(amount);
            let req = Self::margin_required(
                a.position_size.unsigned_abs(),
                oracle_price,
                self.params.initial_margin_bps,
            );
            if eq_after < req {
                return Err(RiskError::InsufficientMargin);
            }
        }

        self.set_capital(idx as usize, capital - amount);
        self.vault = U128::new(self.vault.get().saturating_sub(amount));
        Ok(())
    }

    /// Close a flat, fully settled account and release its capital.
    pub fn close_account(&mut self, idx: u16, now_slot: u64, oracle_price: u64) -> Result<u128> {
        self.current_slot = now_slot;
        self.require_used(idx)?;

        self.settle_funding(idx)?;
        self.advance_warmup(idx);
        self.settle_losses(idx)?;
        self.convert_reserved(idx)?;

        if !self.accounts[idx as usize].position_size.is_zero() {
            return Err(RiskError::PositionOpen);
        }
        // Unvested profit cannot leave through close; it would bypass warmup.
        if self.accounts[idx as usize].pnl_realized.is_positive() {
            return Err(RiskError::PnlNotWarmedUp);
        }
        // Remaining fee debt is uncollectable at this point; forgive it.
        if self.accounts[idx as usize].fee_credits.is_negative() {
            self.accounts[idx as usize].fee_credits = I128::ZERO;
        }

        let capital = self.accounts[idx as usize].capital.get();
        if capital > self.vault.get() {
            return Err(RiskError::InsufficientCapital);
        }
        self.vault = U128::new(self.vault.get() - capital);
        self.set_capital(idx as usize, 0);
        self.free_slot(idx);
        Ok(capital)
    }

    pub fn top_up_insurance(&mut self, amount: u128) -> Result<bool> {
        self.vault = U128::new(self.vault.get().saturating_add(amount));
        // Outstanding socialized loss is retired first; that part backs
        // existing profit claims rather than the fund balance.
        let mut remaining = amount;
        let la = self.loss_accum.get();
        if la > 0 {
            let cover = min(la as u128, remaining);
            self.loss_accum = I128::new(la - u128_to_i128_clamped(cover));
            remaining -= cover;
        }
        if remaining > 0 {
            self.insurance_fund.balance =
                U128::new(self.insurance_fund.balance.get().saturating_add(remaining));
        }
        self.exit_risk_reduction_if_safe();
        Ok(self.insurance_fund.balance.get() >= self.params.risk_reduction_threshold.get())
    }

    // ========================================
    // Crank staleness gates
    // ========================================

    fn require_fresh_sweep(&self, now_slot: u64) -> Result<()> {
        if now_slot.saturating_sub(self.last_full_sweep_start_slot)
            > self.params.max_crank_staleness_slots
        {
            return Err(RiskError::StaleCrank);
        }
        Ok(())
    }

    // ========================================
    // Trading
    // ========================================

    /// Execute a user<->LP trade through the matching engine.
    ///
    /// Mutations past the validation prefix rely on host transaction
    /// atomicity: an Err return aborts the operation and the slab view is
    /// discarded uncommitted.
    pub fn execute_trade<M: MatchingEngine>(
        &mut self,
        matcher: &M,
        lp_idx: u16,
        user_idx: u16,
        now_slot: u64,
        oracle_price: u64,
        size: i128,
    ) -> Result<()> {
        self.current_slot = now_slot;
        self.require_fresh_sweep(now_slot)?;
        self.require_used(lp_idx)?;
        self.require_used(user_idx)?;
        if lp_idx == user_idx {
            return Err(RiskError::InvalidIndex);
        }
        if oracle_price == 0 || oracle_price > MAX_ORACLE_PRICE {
            return Err(RiskError::OraclePriceInvalid);
        }
        if size == 0 {
            return Err(RiskError::ZeroSize);
        }
        if size == i128::MIN || sat_abs_i128(size) as u128 > MAX_POSITION_ABS {
            return Err(RiskError::ArithmeticOverflow);
        }
        if !self.accounts[lp_idx as usize].is_lp() || !self.accounts[user_idx as usize].is_user() {
            return Err(RiskError::AccountKindMismatch);
        }

        // Funding settles before any risk math reads PnL.
        self.settle_funding(user_idx)?;
        self.settle_funding(lp_idx)?;

        let lp = &self.accounts[lp_idx as usize];
        let execution = matcher.execute_match(
            &lp.matcher_program,
            &lp.matcher_context,
            lp.account_id,
            oracle_price,
            size,
        )?;
        let exec_price = execution.price;
        let exec_size = execution.size;

        // Matcher output is a trust boundary: bounded price, same-direction
        // at-most-requested size.
        if exec_price == 0 || exec_price > MAX_ORACLE_PRICE {
            return Err(RiskError::MatcherReturnedBadPrice);
        }
        if exec_size == 0 {
            return Ok(()); // no fill, no side effects
        }
        if exec_size == i128::MIN
            || (exec_size > 0) != (size > 0)
            || sat_abs_i128(exec_size) > sat_abs_i128(size)
        {
            return Err(RiskError::MatcherReturnedBadPrice);
        }

        let old_user_pos = self.accounts[user_idx as usize].position_size.get();
        let old_lp_pos = self.accounts[lp_idx as usize].position_size.get();
        let new_user_pos = old_user_pos
            .checked_add(exec_size)
            .ok_or(RiskError::ArithmeticOverflow)?;
        let new_lp_pos = old_lp_pos
            .checked_sub(exec_size)
            .ok_or(RiskError::ArithmeticOverflow)?;
        if sat_abs_i128(new_user_pos) as u128 > MAX_POSITION_ABS
            || sat_abs_i128(new_lp_pos) as u128 > MAX_POSITION_ABS
        {
            return Err(RiskError::ArithmeticOverflow);
        }

        // A flip through zero counts as risk-increasing for that side.
        let user_inc = sat_abs_i128(new_user_pos) > sat_abs_i128(old_user_pos)
            || (old_user_pos > 0 && new_user_pos < 0)
            || (old_user_pos < 0 && new_user_pos > 0);
        let lp_inc = sat_abs_i128(new_lp_pos) > sat_abs_i128(old_lp_pos)
            || (old_lp_pos > 0 && new_lp_pos < 0)
            || (old_lp_pos < 0 && new_lp_pos > 0);
        if self.risk_reduction_only != 0 && (user_inc || lp_inc) {
            return Err(RiskError::RiskReductionOnly);
        }

        // Fee on executed notional, charged to both sides, rounded up so no
        // micro-trade escapes it.
        let notional = sat_abs_i128(exec_size) as u128 * exec_price as u128 / PRICE_SCALE;
        let fee = if notional > 0 && self.params.trading_fee_bps > 0 {
            (notional.saturating_mul(self.params.trading_fee_bps as u128) + (BPS_DENOM - 1))
                / BPS_DENOM
        } else {
            0
        };
        if self.accounts[user_idx as usize].capital.get() < fee
            || self.accounts[lp_idx as usize].capital.get() < fee
        {
            return Err(RiskError::InsufficientCapital);
        }

        // Symmetric fill.
        let user_realized = self.apply_fill(user_idx as usize, exec_size, exec_price)?;
        let lp_realized = self.apply_fill(lp_idx as usize, -exec_size, exec_price)?;

        self.charge_trading_fee(user_idx as usize, fee);
        self.charge_trading_fee(lp_idx as usize, fee);

        if user_realized > 0 {
            self.restart_warmup(user_idx);
        }
        if lp_realized > 0 {
            self.restart_warmup(lp_idx);
        }

        // Two-pass settlement: every loss lands before any profit converts,
        // so the haircut reads the post-loss residual.
        self.settle_losses(user_idx)?;
        self.settle_losses(lp_idx)?;
        self.convert_reserved(user_idx)?;
        self.convert_reserved(lp_idx)?;

        // Initial margin for each side that grew its exposure.
        if user_inc
            && new_user_pos != 0
            && !self.meets_margin(user_idx, oracle_price, self.params.initial_margin_bps)
        {
            return Err(RiskError::InsufficientMargin);
        }
        if lp_inc
            && new_lp_pos != 0
            && !self.meets_margin(lp_idx, oracle_price, self.params.initial_margin_bps)
        {
            return Err(RiskError::InsufficientMargin);
        }
        Ok(())
    }

    /// Trading fees accrue to insurance and mirror into the payer's fee
    /// credits as maintenance offsets.
    fn charge_trading_fee(&mut self, idx: usize, fee: u128) {
        if fee == 0 {
            return;
        }
        let cap = self.accounts[idx].capital.get();
        self.set_capital(idx, cap.saturating_sub(fee));
        self.insurance_fund.balance =
            U128::new(self.insurance_fund.balance.get().saturating_add(fee));
        self.insurance_fund.fee_revenue =
            U128::new(self.insurance_fund.fee_revenue.get().saturating_add(fee));
        let credits = self.accounts[idx].fee_credits.get();
        self.accounts[idx].fee_credits =
            I128::new(credits.saturating_add(u128_to_i128_clamped(fee)));
    }

    // ========================================
    // Maintenance fees
    // ========================================

    /// Charge `fee_per_slot * window` against an account: credits first,
    /// then capital; the unpayable remainder stays as negative credits.
    fn charge_maintenance_fee(&mut self, idx: u16, window_slots: u64) {
        let due = self
            .params
            .maintenance_fee_per_slot
            .get()
            .saturating_mul(window_slots as u128);
        if due == 0 {
            return;
        }
        let credits = self.accounts[idx as usize].fee_credits.get();
        let credits = credits.saturating_sub(u128_to_i128_clamped(due));
        self.accounts[idx as usize].fee_credits = I128::new(credits);
        if credits < 0 {
            let owed = neg_i128_to_u128(credits);
            let cap = self.accounts[idx as usize].capital.get();
            let pay = min(owed, cap);
            if pay > 0 {
                self.set_capital(idx as usize, cap - pay);
                self.insurance_fund.balance =
                    U128::new(self.insurance_fund.balance.get().saturating_add(pay));
                self.insurance_fund.fee_revenue =
                    U128::new(self.insurance_fund.fee_revenue.get().saturating_add(pay));
                self.accounts[idx as usize].fee_credits =
                    I128::new(credits.saturating_add(u128_to_i128_clamped(pay)));
            }
        }
    }

    // ========================================
    // Liquidation
    // ========================================

    /// Closed-form close amount restoring equity to maintenance + buffer.
    /// Returns (close_abs, is_full_close).
    pub fn compute_liquidation_close_amount(
        &self,
        account: &Account,
        oracle_price: u64,
    ) -> (u128, bool) {
        let abs_pos = account.position_size.unsigned_abs();
        if abs_pos == 0 {
            return (0, false);
        }
        let equity = self.effective_equity(account, oracle_price);
        let target_bps = self
            .params
            .maintenance_margin_bps
            .saturating_add(self.params.liquidation_buffer_bps);

        // Largest remaining position still meeting target margin:
        // safe_max = equity * 10^4 * 10^6 / (price * target_bps)
        let denominator = (oracle_price as u128).saturating_mul(target_bps as u128);
        let mut safe_max = if denominator == 0 {
            0
        } else {
            equity.saturating_mul(BPS_DENOM * PRICE_SCALE) / denominator
        };
        safe_max = min(safe_max, abs_pos);
        // Round one unit against the account so truncation cannot leave it
        // on the wrong side of the inequality.
        if safe_max > 0 {
            safe_max -= 1;
        }
        let close_abs = abs_pos - safe_max;
        let remaining = abs_pos - close_abs;
        if remaining < self.params.min_liquidation_abs.get() {
            return (abs_pos, true);
        }
        (close_abs, close_abs == abs_pos)
    }

    /// Pick the account to absorb a forced close's reverse leg: the largest
    /// opposite-signed position, LPs preferred. Users only acquire exposure
    /// against LPs, so a user target always finds an LP here; an LP target
    /// may force-reduce the largest opposite user (ADL).
    fn find_counterparty(&self, exclude: usize, target_is_long: bool) -> Option<usize> {
        let mut best: Option<(bool, u128, usize)> = None;
        self.for_each_used(|i, a| {
            if i == exclude {
                return;
            }
            let p = a.position_size.get();
            let opposite = if target_is_long { p < 0 } else { p > 0 };
            if !opposite {
                return;
            }
            let key = (a.is_lp(), p.unsigned_abs());
            match best {
                Some((bl, ba, _)) if (bl, ba) >= key => {}
                _ => best = Some((key.0, key.1, i)),
            }
        });
        best.map(|(_, _, i)| i)
    }

    /// Close up to `close_abs` units of `idx` at the oracle price, booking
    /// the symmetric reverse leg against opposite-side counterparties so the
    /// long and short books stay balanced. Returns units actually closed;
    /// counterparty indices are appended to `touched`.
    fn close_paired(
        &mut self,
        idx: u16,
        close_abs: u128,
        oracle_price: u64,
        touched: &mut [u16; CLOSE_PAIR_BUDGET],
        touched_len: &mut usize,
    ) -> Result<u128> {
        let pos = self.accounts[idx as usize].position_size.get();
        if pos == 0 || close_abs == 0 {
            return Ok(0);
        }
        let long = pos > 0;
        let mut remaining = min(close_abs, pos.unsigned_abs());
        let total = remaining;
        while remaining > 0 && *touched_len < CLOSE_PAIR_BUDGET {
            let cp = match self.find_counterparty(idx as usize, long) {
                Some(cp) => cp,
                None => break,
            };
            let cp_abs = self.accounts[cp].position_size.unsigned_abs();
            let step = min(remaining, cp_abs);
            let step_i = u128_to_i128_clamped(step);
            let (target_delta, cp_delta) = if long {
                (-step_i, step_i)
            } else {
                (step_i, -step_i)
            };
            self.apply_fill(idx as usize, target_delta, oracle_price)?;
            let cp_realized = self.apply_fill(cp, cp_delta, oracle_price)?;
            if cp_realized > 0 {
                self.restart_warmup(cp as u16);
            }
            touched[*touched_len] = cp as u16;
            *touched_len += 1;
            remaining -= step;
        }
        Ok(total - remaining)
    }

    /// Liquidate `idx` if it sits below maintenance margin.
    /// Returns Ok(false) when the account is healthy.
    fn liquidate_if_unhealthy(&mut self, idx: u16, oracle_price: u64) -> Result<bool> {
        if self.accounts[idx as usize].position_size.is_zero() {
            return Ok(false);
        }
        self.settle_funding(idx)?;

        if self.meets_margin(idx, oracle_price, self.params.maintenance_margin_bps) {
            return Ok(false);
        }
        let (close_abs, mut full) =
            self.compute_liquidation_close_amount(&self.accounts[idx as usize], oracle_price);
        if close_abs == 0 {
            return Err(RiskError::LiquidationTooSmall);
        }

        let mut touched = [0u16; CLOSE_PAIR_BUDGET];
        let mut touched_len = 0usize;
        let mut closed = self.close_paired(idx, close_abs, oracle_price, &mut touched, &mut touched_len)?;
        if closed == 0 {
            return Ok(false); // no counterparty capacity this round
        }

        // If the remainder still fails the buffered target, finish the job.
        if !self.accounts[idx as usize].position_size.is_zero() {
            let target_bps = self
                .params
                .maintenance_margin_bps
                .saturating_add(self.params.liquidation_buffer_bps);
            if !self.meets_margin(idx, oracle_price, target_bps) {
                let rest = self.accounts[idx as usize].position_size.unsigned_abs();
                closed = closed.saturating_add(self.close_paired(
                    idx,
                    rest,
                    oracle_price,
                    &mut touched,
                    &mut touched_len,
                )?);
                full = true;
            }
        }

        // Liquidation fee: capped, from remaining capital, fully to insurance.
        let notional = closed.saturating_mul(oracle_price as u128) / PRICE_SCALE;
        let fee_raw = if notional > 0 && self.params.liquidation_fee_bps > 0 {
            (notional.saturating_mul(self.params.liquidation_fee_bps as u128) + (BPS_DENOM - 1))
                / BPS_DENOM
        } else {
            0
        };
        let fee = min(fee_raw, self.params.liquidation_fee_cap.get());
        let cap = self.accounts[idx as usize].capital.get();
        let pay = min(fee, cap);
        if pay > 0 {
            self.set_capital(idx as usize, cap - pay);
            self.insurance_fund.balance =
                U128::new(self.insurance_fund.balance.get().saturating_add(pay));
            self.insurance_fund.fee_revenue =
                U128::new(self.insurance_fund.fee_revenue.get().saturating_add(pay));
        }

        // Two-pass over the touched set: all losses, then all conversions.
        self.settle_losses(idx)?;
        for i in 0..touched_len {
            self.settle_losses(touched[i])?;
        }
        self.convert_reserved(idx)?;
        for i in 0..touched_len {
            self.convert_reserved(touched[i])?;
        }

        self.lifetime_liquidations = self.lifetime_liquidations.saturating_add(1);
        if full && self.accounts[idx as usize].position_size.is_zero() {
            self.lifetime_force_closes = self.lifetime_force_closes.saturating_add(1);
        }
        Ok(true)
    }

    /// Permissionless liquidation at the oracle mark.
    pub fn liquidate_at_oracle(&mut self, idx: u16, now_slot: u64, oracle_price: u64) -> Result<()> {
        self.current_slot = now_slot;
        self.require_used(idx)?;
        if oracle_price == 0 || oracle_price > MAX_ORACLE_PRICE {
            return Err(RiskError::OraclePriceInvalid);
        }
        match self.liquidate_if_unhealthy(idx, oracle_price)? {
            true => Ok(()),
            false => Err(RiskError::AccountHealthy),
        }
    }

    /// Force-close an entire position at the oracle (risk-reduction mode
    /// drain). Settles both legs.
    fn force_close_position(&mut self, idx: u16, oracle_price: u64) -> Result<bool> {
        let abs = self.accounts[idx as usize].position_size.unsigned_abs();
        if abs == 0 {
            return Ok(false);
        }
        self.settle_funding(idx)?;
        let mut touched = [0u16; CLOSE_PAIR_BUDGET];
        let mut touched_len = 0usize;
        let closed = self.close_paired(idx, abs, oracle_price, &mut touched, &mut touched_len)?;
        if closed == 0 {
            return Ok(false);
        }
        self.settle_losses(idx)?;
        for i in 0..touched_len {
            self.settle_losses(touched[i])?;
        }
        self.convert_reserved(idx)?;
        for i in 0..touched_len {
            self.convert_reserved(touched[i])?;
        }
        self.lifetime_force_closes = self.lifetime_force_closes.saturating_add(1);
        Ok(true)
    }

    // ========================================
    // Keeper crank
    // ========================================

    /// The single permissionless "do the right thing" entrypoint: funding,
    /// maintenance fees, warmup, settlement, liquidations, mode transitions
    /// and stranded-funds recovery, over a bounded window of the book.
    ///
    /// With `allow_panic` set, any per-account error aborts the whole crank;
    /// otherwise the slot is skipped and counted in the outcome.
    pub fn keeper_crank(
        &mut self,
        now_slot: u64,
        oracle_price: u64,
        allow_panic: bool,
    ) -> Result<CrankOutcome> {
        if oracle_price == 0 || oracle_price > MAX_ORACLE_PRICE {
            return Err(RiskError::OraclePriceInvalid);
        }
        self.current_slot = now_slot;

        let starting_new_sweep = self.crank_cursor == self.sweep_start_idx;
        if starting_new_sweep {
            self.last_full_sweep_start_slot = now_slot;
            self.lp_max_abs_sweep = U128::ZERO;
        }

        self.accrue_funding(now_slot, oracle_price)?;

        let mut out = CrankOutcome {
            advanced: now_slot > self.last_crank_slot,
            ..CrankOutcome::default()
        };
        let fee_window = now_slot.saturating_sub(self.last_crank_slot);
        let force_realize = self.risk_reduction_only != 0 && self.loss_accum.is_positive();

        let mut liq_budget = LIQ_BUDGET_PER_CRANK;
        let mut force_budget = FORCE_CLOSE_BUDGET_PER_CRANK;
        let mut processed: u16 = 0;
        let mut scanned: usize = 0;
        let mut idx = self.crank_cursor as usize;

        while processed < ACCOUNTS_PER_CRANK && scanned < MAX_ACCOUNTS {
            scanned += 1;
            if self.is_used(idx) {
                processed += 1;
                let step = self.crank_step(
                    idx as u16,
                    oracle_price,
                    fee_window,
                    force_realize,
                    &mut liq_budget,
                    &mut force_budget,
                    &mut out,
                );
                if let Err(e) = step {
                    if allow_panic {
                        return Err(e);
                    }
                    out.num_errors = out.num_errors.saturating_add(1);
                }
                if self.is_used(idx) && self.accounts[idx].is_lp() {
                    let abs = self.accounts[idx].position_size.unsigned_abs();
                    self.lp_max_abs_sweep = U128::new(self.lp_max_abs_sweep.get().max(abs));
                }
            }
            idx = (idx + 1) & ACCOUNT_IDX_MASK;
            if idx == self.sweep_start_idx as usize {
                out.sweep_complete = true;
                break;
            }
        }
        self.crank_cursor = idx as u16;
        if out.sweep_complete {
            self.lp_max_abs = self.lp_max_abs_sweep;
            self.sweep_start_idx = self.crank_cursor;
        }

        // Mode transitions: insurance below threshold engages risk
        // reduction; a recovered fund with no outstanding loss disengages.
        if self.insurance_fund.balance.get() < self.params.risk_reduction_threshold.get() {
            self.enter_risk_reduction();
        } else {
            self.exit_risk_reduction_if_safe();
        }

        out.recovered = self.try_recover();
        if out.advanced {
            self.last_crank_slot = now_slot;
        }
        out.last_cursor = self.crank_cursor;
        Ok(out)
    }

    fn crank_step(
        &mut self,
        idx: u16,
        oracle_price: u64,
        fee_window: u64,
        force_realize: bool,
        liq_budget: &mut u16,
        force_budget: &mut u16,
        out: &mut CrankOutcome,
    ) -> Result<()> {
        self.settle_funding(idx)?;
        self.charge_maintenance_fee(idx, fee_window);
        self.advance_warmup(idx);
        self.settle_losses(idx)?;
        self.convert_reserved(idx)?;

        if force_realize {
            if *force_budget > 0 && !self.accounts[idx as usize].position_size.is_zero() {
                if self.force_close_position(idx, oracle_price)? {
                    out.num_force_closes = out.num_force_closes.saturating_add(1);
                    *force_budget -= 1;
                }
            }
        } else if *liq_budget > 0 && !self.accounts[idx as usize].position_size.is_zero() {
            match self.liquidate_if_unhealthy(idx, oracle_price) {
                Ok(true) => {
                    out.num_liquidations = out.num_liquidations.saturating_add(1);
                    *liq_budget -= 1;
                }
                Ok(false) => {}
                Err(RiskError::LiquidationTooSmall) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stranded-funds recovery. Once losses were socialized and the book is
    /// flat, the remaining positive PnL claims have no counterparties left
    /// to pay them: write them off, sweep the vault surplus into insurance
    /// and reopen the market.
    fn try_recover(&mut self) -> bool {
        if self.risk_reduction_only == 0
            || !self.loss_accum.is_positive()
            || !self.total_open_interest.is_zero()
        {
            return false;
        }
        for i in 0..MAX_ACCOUNTS {
            if !self.is_used(i) {
                continue;
            }
            if self.accounts[i].pnl_realized.is_positive() {
                self.set_pnl(i, 0);
            }
            if !self.accounts[i].pnl_reserved.is_zero() {
                self.set_reserved(i, 0);
            }
        }
        self.loss_accum = I128::ZERO;
        self.insurance_fund.balance =
            U128::new(self.vault.get().saturating_sub(self.c_tot.get()));
        self.risk_reduction_only = 0;
        self.warmup_paused = 0;
        true
    }

    // ========================================
    // Admin
    // ========================================

    #[inline]
    pub fn set_risk_reduction_threshold(&mut self, new_threshold: u128) {
        self.params.risk_reduction_threshold = U128::new(new_threshold);
    }

    #[inline]
    pub fn risk_reduction_threshold(&self) -> u128 {
        self.params.risk_reduction_threshold.get()
    }

    /// Store an authority-pushed price. The caller has already verified the
    /// authority signature; the engine only rejects a zero price. No other
    /// validation applies to this trusted surface.
    pub fn push_authority_price(&mut self, price_e6: u64, timestamp: i64) -> Result<()> {
        if price_e6 == 0 {
            return Err(RiskError::OraclePriceInvalid);
        }
        self.authority_price_e6 = price_e6;
        self.authority_timestamp = timestamp;
        Ok(())
    }

    pub fn clear_authority_price(&mut self) {
        self.authority_price_e6 = 0;
        self.authority_timestamp = 0;
    }

    // ========================================
    // Invariants
    // ========================================

    /// Conservation: claims never exceed backing plus the socialized-loss
    /// marker, modulo bounded rounding.
    /// vault + loss_accum + slack >= C_tot + insurance + pnl_pos_tot.
    pub fn check_conservation(&self) -> bool {
        let mut total_capital = 0u128;
        let mut claims = 0u128;
        self.for_each_used(|_idx, a| {
            total_capital = total_capital.saturating_add(a.capital.get());
            let pnl = a.pnl_realized.get();
            if pnl > 0 {
                claims = claims.saturating_add(pnl as u128);
            }
            claims = claims.saturating_add(a.pnl_reserved.get());
        });
        let la = self.loss_accum.get();
        let lhs = self
            .vault
            .get()
            .saturating_add(if la > 0 { la as u128 } else { 0 })
            .saturating_add(MAX_ROUNDING_SLACK);
        let rhs = total_capital
            .saturating_add(self.insurance_fund.balance.get())
            .saturating_add(claims);
        lhs >= rhs
    }

    /// Bitmap integrity: the used counter equals the popcount.
    pub fn check_bitmap(&self) -> bool {
        let mut count = 0u32;
        for w in self.used.iter() {
            count += w.count_ones();
        }
        count == self.num_used_accounts as u32
    }

    /// Id monotonicity and uniqueness over used slots.
    pub fn check_account_ids(&self) -> bool {
        let mut ok = true;
        self.for_each_used(|i, a| {
            if a.account_id >= self.next_account_id {
                ok = false;
            }
            self.for_each_used(|j, b| {
                if i != j && a.account_id == b.account_id {
                    ok = false;
                }
            });
        });
        ok
    }

    /// Open-interest balance: the long book equals the short book.
    pub fn check_oi_balance(&self) -> bool {
        let mut long = 0u128;
        let mut short = 0u128;
        self.for_each_used(|_idx, a| {
            let p = a.position_size.get();
            if p > 0 {
                long = long.saturating_add(p as u128);
            } else if p < 0 {
                short = short.saturating_add(neg_i128_to_u128(p));
            }
        });
        long == short
    }

    /// Test helper: advance the engine clock without a full operation.
    #[cfg(any(test, feature = "test", kani))]
    pub fn advance_slot(&mut self, slots: u64) {
        self.current_slot = self.current_slot.saturating_add(slots);
    }
}

#[cfg(test)]
mod tests;
