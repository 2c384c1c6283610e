//! Deterministic simulation world.
//!
//! Stands in for the collaborators the interpreter meets on chain: token
//! contracts with a mint/transfer/balance-of command set and a lender pool
//! that disburses a flash loan, invokes the callback, and verifies its
//! reserves recovered principal plus fee. Everything runs against the
//! journaled ledger, so a failed flash has zero observable effect.

use flashcall_wire::{Address, WORD_BYTES};

use crate::exec::{CallRouter, FlashExecutor, FlashLoanError, LoanTerms, RoutedCall, RunReport};
use crate::ledger::{LedgerError, TokenLedger};

/// Token command selectors: 4 big-endian bytes, then 32-byte argument
/// words with addresses left-padded. The values are the standard
/// `mint`, `transfer`, and `balanceOf` selectors.
pub const SEL_MINT: u32 = 0x40c1_0f19;
pub const SEL_TRANSFER: u32 = 0xa905_9cbb;
pub const SEL_BALANCE_OF: u32 = 0x70a0_8231;

pub fn mint_payload(to: Address, amount: u128) -> Vec<u8> {
    two_word_payload(SEL_MINT, to, amount)
}

pub fn transfer_payload(to: Address, amount: u128) -> Vec<u8> {
    two_word_payload(SEL_TRANSFER, to, amount)
}

pub fn balance_of_payload(who: Address) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + WORD_BYTES);
    out.extend_from_slice(&SEL_BALANCE_OF.to_be_bytes());
    out.extend_from_slice(&who.to_word());
    out
}

/// Byte offset of the amount argument in a transfer payload; the slot a
/// patch overwrites to forward a previously captured balance.
pub const TRANSFER_AMOUNT_OFFSET: usize = 4 + WORD_BYTES;

fn two_word_payload(selector: u32, addr: Address, amount: u128) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * WORD_BYTES);
    out.extend_from_slice(&selector.to_be_bytes());
    out.extend_from_slice(&addr.to_word());
    out.extend_from_slice(&amount_word(amount));
    out
}

fn amount_word(amount: u128) -> [u8; WORD_BYTES] {
    let mut word = [0u8; WORD_BYTES];
    word[WORD_BYTES - 16..].copy_from_slice(&amount.to_be_bytes());
    word
}

/// Routes sub-calls to the token contracts registered in the world.
///
/// A token's account address is the contract itself; its balances live in
/// the ledger under that address.
#[derive(Debug, Default, Clone)]
pub struct WorldRouter {
    tokens: Vec<Address>,
}

impl WorldRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_token(&mut self, token: Address) {
        if !self.tokens.contains(&token) {
            self.tokens.push(token);
        }
    }
}

impl CallRouter for WorldRouter {
    fn route(&mut self, ledger: &mut TokenLedger, call: &RoutedCall<'_>) -> Result<Vec<u8>, String> {
        if !self.tokens.contains(&call.target) {
            return Err(format!("unknown target {}", call.target));
        }
        token_call(ledger, call)
    }
}

fn token_call(ledger: &mut TokenLedger, call: &RoutedCall<'_>) -> Result<Vec<u8>, String> {
    let token = call.target;
    let payload = call.payload;
    if payload.len() < 4 {
        return Err("calldata shorter than a selector".to_string());
    }
    let selector = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let args = &payload[4..];
    match selector {
        SEL_MINT => {
            let (to, amount) = address_amount_args(args)?;
            ledger.mint(token, to, amount).map_err(revert)?;
            Ok(Vec::new())
        }
        SEL_TRANSFER => {
            let (to, amount) = address_amount_args(args)?;
            ledger
                .transfer(token, call.caller, to, amount)
                .map_err(revert)?;
            Ok(Vec::new())
        }
        SEL_BALANCE_OF => {
            let who = address_arg(arg_word(args, 0)?)?;
            if args.len() != WORD_BYTES {
                return Err("balance_of takes exactly one word".to_string());
            }
            Ok(amount_word(ledger.balance_of(token, who)).to_vec())
        }
        _ => Err(format!("unknown selector 0x{selector:08x}")),
    }
}

fn revert(e: LedgerError) -> String {
    e.to_string()
}

fn arg_word(args: &[u8], index: usize) -> Result<&[u8], String> {
    let start = index * WORD_BYTES;
    args.get(start..start + WORD_BYTES)
        .ok_or_else(|| format!("calldata missing argument word {index}"))
}

fn address_arg(word: &[u8]) -> Result<Address, String> {
    Address::from_word(word).ok_or_else(|| "argument word is not an address".to_string())
}

fn address_amount_args(args: &[u8]) -> Result<(Address, u128), String> {
    if args.len() != 2 * WORD_BYTES {
        return Err("expected exactly two argument words".to_string());
    }
    let to = address_arg(arg_word(args, 0)?)?;
    let amount_bytes = arg_word(args, 1)?;
    if amount_bytes[..WORD_BYTES - 16].iter().any(|&b| b != 0) {
        return Err("amount word exceeds u128 range".to_string());
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&amount_bytes[WORD_BYTES - 16..]);
    Ok((to, u128::from_be_bytes(raw)))
}

/// Parts-per-million base of the pool fee formula.
pub const FEE_PPM_BASE: u128 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// The pool could not disburse the principal.
    Disburse(LedgerError),
    /// The fee formula overflowed for the requested amount.
    FeeOverflow { amount: u128 },
    /// The callback itself failed.
    Callback(FlashLoanError),
    /// The callback returned but the pool's reserves came up short.
    ReservesShort { expected: u128, actual: u128 },
}

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashError::Disburse(e) => write!(f, "flash disbursement failed: {e}"),
            FlashError::FeeOverflow { amount } => {
                write!(f, "fee computation overflowed for amount {amount}")
            }
            FlashError::Callback(e) => write!(f, "flash callback failed: {e}"),
            FlashError::ReservesShort { expected, actual } => {
                write!(f, "pool reserves short after flash: expected {expected}, have {actual}")
            }
        }
    }
}

impl std::error::Error for FlashError {}

impl From<FlashLoanError> for FlashError {
    fn from(e: FlashLoanError) -> Self {
        FlashError::Callback(e)
    }
}

/// Lender collaborator: holds reserves of one token and grants flash loans
/// against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LenderPool {
    pub address: Address,
    pub token: Address,
    pub fee_ppm: u32,
}

impl LenderPool {
    /// Fee the pool charges on `amount`:
    /// `amount * (1_000_000 - fee_ppm) / 1_000_000`.
    pub fn fee_for(&self, amount: u128) -> Option<u128> {
        let scale = FEE_PPM_BASE.checked_sub(u128::from(self.fee_ppm))?;
        amount.checked_mul(scale).map(|n| n / FEE_PPM_BASE)
    }

    /// Grants a flash loan of `amount` to the executor and invokes its
    /// callback with `data`. The whole flash is one unit of work: on any
    /// failure the ledger is exactly as it was before the call.
    pub fn flash(
        &self,
        router: &mut dyn CallRouter,
        ledger: &mut TokenLedger,
        executor: &FlashExecutor,
        initiator: Address,
        amount: u128,
        data: &[u8],
    ) -> Result<RunReport, FlashError> {
        let fee = self
            .fee_for(amount)
            .ok_or(FlashError::FeeOverflow { amount })?;
        let reserves_before = ledger.balance_of(self.token, self.address);

        let cp = ledger.checkpoint();
        let result = self.flash_inner(router, ledger, executor, initiator, amount, fee, data);
        match result {
            Ok(report) => {
                let reserves_after = ledger.balance_of(self.token, self.address);
                let expected = reserves_before.saturating_add(fee);
                if reserves_after < expected {
                    ledger.rollback_to(cp);
                    return Err(FlashError::ReservesShort {
                        expected,
                        actual: reserves_after,
                    });
                }
                ledger.commit(cp);
                Ok(report)
            }
            Err(e) => {
                ledger.rollback_to(cp);
                Err(e)
            }
        }
    }

    fn flash_inner(
        &self,
        router: &mut dyn CallRouter,
        ledger: &mut TokenLedger,
        executor: &FlashExecutor,
        initiator: Address,
        amount: u128,
        fee: u128,
        data: &[u8],
    ) -> Result<RunReport, FlashError> {
        ledger
            .transfer(self.token, self.address, executor.address(), amount)
            .map_err(FlashError::Disburse)?;
        let loan = LoanTerms {
            lender: self.address,
            initiator,
            token: self.token,
            principal: amount,
            fee,
        };
        let report = executor.on_flash_loan(router, ledger, &loan, data)?;
        Ok(report)
    }
}
