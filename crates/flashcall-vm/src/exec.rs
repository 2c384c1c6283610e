//! Sequence executor.
//!
//! Walks a decoded call sequence inside a flash-loan callback: applies
//! patch instructions against payloads, dispatches each sub-call through
//! the invoke capability, captures return data for later patches, and
//! enforces loan repayment before returning. Any error unwinds every
//! ledger effect of the run.

use std::cell::Cell;
use std::rc::Rc;

use serde::Serialize;

use flashcall_wire::{decode, Address, CallRecord, DecodeError, WORD_BYTES};

use crate::ledger::TokenLedger;

/// Terms of the active loan, fixed for the duration of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanTerms {
    pub lender: Address,
    pub initiator: Address,
    pub token: Address,
    pub principal: u128,
    pub fee: u128,
}

impl LoanTerms {
    pub fn owed(&self) -> u128 {
        self.principal.saturating_add(self.fee)
    }
}

/// One dispatched sub-call, as seen by the invoke capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedCall<'a> {
    pub caller: Address,
    pub target: Address,
    pub value: u128,
    pub payload: &'a [u8],
}

/// Invoke capability: dispatch an opaque command to an arbitrary target.
///
/// The executor does not interpret return data beyond re-injecting it into
/// later payloads; a returned `Err` is the target reverting, with the
/// reason surfaced verbatim.
pub trait CallRouter {
    fn route(&mut self, ledger: &mut TokenLedger, call: &RoutedCall<'_>) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    MissingCapture {
        index: usize,
        source_index: usize,
    },
    OutOfBounds {
        index: usize,
        dest_offset: usize,
        payload_len: usize,
    },
    SubCallReverted {
        index: usize,
        reason: String,
    },
    LoanUnrepaid {
        owed: u128,
        repaid: u128,
    },
    Reentrant,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::MissingCapture {
                index,
                source_index,
            } => write!(
                f,
                "record {index} patches from record {source_index}, which has not executed"
            ),
            ExecutionError::OutOfBounds {
                index,
                dest_offset,
                payload_len,
            } => write!(
                f,
                "record {index} patch at offset {dest_offset} exceeds its {payload_len}-byte payload"
            ),
            ExecutionError::SubCallReverted { index, reason } => {
                write!(f, "sub-call {index} reverted: {reason}")
            }
            ExecutionError::LoanUnrepaid { owed, repaid } => {
                write!(f, "loan unrepaid: owed {owed}, repaid {repaid}")
            }
            ExecutionError::Reentrant => write!(f, "executor invoked while a run is in progress"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Failure of one flash-loan callback: either the buffer did not decode or
/// the sequence did not execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashLoanError {
    Decode(DecodeError),
    Exec(ExecutionError),
}

impl std::fmt::Display for FlashLoanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashLoanError::Decode(e) => write!(f, "{e}"),
            FlashLoanError::Exec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FlashLoanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlashLoanError::Decode(e) => Some(e),
            FlashLoanError::Exec(e) => Some(e),
        }
    }
}

impl From<DecodeError> for FlashLoanError {
    fn from(e: DecodeError) -> Self {
        FlashLoanError::Decode(e)
    }
}

impl From<ExecutionError> for FlashLoanError {
    fn from(e: ExecutionError) -> Self {
        FlashLoanError::Exec(e)
    }
}

/// Summary of one successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub records: usize,
    pub patched: usize,
    pub repaid: u128,
}

/// The call-list interpreter, addressable as the account that holds
/// borrowed funds during a run.
///
/// Clones share the in-flight guard, so a target that reaches a clone of
/// the executor mid-run still cannot start a nested run.
#[derive(Debug, Clone)]
pub struct FlashExecutor {
    address: Address,
    in_flight: Rc<Cell<bool>>,
}

impl FlashExecutor {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            in_flight: Rc::new(Cell::new(false)),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Flash-loan callback: decodes `data` into a call sequence and runs it.
    ///
    /// The lending collaborator invokes this once per loan, after
    /// disbursing the principal to the executor account, with the exact fee
    /// it requires repaid.
    pub fn on_flash_loan(
        &self,
        router: &mut dyn CallRouter,
        ledger: &mut TokenLedger,
        loan: &LoanTerms,
        data: &[u8],
    ) -> Result<RunReport, FlashLoanError> {
        let records = decode(data)?;
        self.run(router, ledger, loan, records).map_err(Into::into)
    }

    /// Executes a call sequence under the loan terms, all-or-nothing.
    ///
    /// Records execute strictly in order; each may be patched from an
    /// earlier capture, is dispatched exactly once, and has its return data
    /// captured whether or not a later record consumes it. After the final
    /// record the lender must be ahead by principal + fee, or the run fails
    /// and the ledger rolls back to its state at entry.
    pub fn run(
        &self,
        router: &mut dyn CallRouter,
        ledger: &mut TokenLedger,
        loan: &LoanTerms,
        records: Vec<CallRecord>,
    ) -> Result<RunReport, ExecutionError> {
        if self.in_flight.replace(true) {
            return Err(ExecutionError::Reentrant);
        }
        let cp = ledger.checkpoint();
        let result = self.run_inner(router, ledger, loan, records);
        if result.is_err() {
            ledger.rollback_to(cp);
        }
        self.in_flight.set(false);
        result
    }

    fn run_inner(
        &self,
        router: &mut dyn CallRouter,
        ledger: &mut TokenLedger,
        loan: &LoanTerms,
        records: Vec<CallRecord>,
    ) -> Result<RunReport, ExecutionError> {
        let lender_entry = ledger.balance_of(loan.token, loan.lender);
        let mut captured: Vec<Vec<u8>> = Vec::with_capacity(records.len());
        let mut patched = 0usize;

        for (index, mut record) in records.into_iter().enumerate() {
            if let Some(patch) = record.patch {
                let source_index = patch.source_index();
                let capture = captured.get(source_index).ok_or(
                    ExecutionError::MissingCapture {
                        index,
                        source_index,
                    },
                )?;
                let word = capture_word(capture);
                apply_patch(&mut record.payload, patch.dest_offset(), &word).map_err(|()| {
                    ExecutionError::OutOfBounds {
                        index,
                        dest_offset: patch.dest_offset(),
                        payload_len: record.payload.len(),
                    }
                })?;
                patched += 1;
            }

            if record.value > 0 {
                ledger
                    .transfer_native(self.address, record.target, record.value)
                    .map_err(|e| ExecutionError::SubCallReverted {
                        index,
                        reason: e.to_string(),
                    })?;
            }

            let call = RoutedCall {
                caller: self.address,
                target: record.target,
                value: record.value,
                payload: &record.payload,
            };
            let ret = router
                .route(ledger, &call)
                .map_err(|reason| ExecutionError::SubCallReverted { index, reason })?;
            captured.push(ret);
        }

        let repaid = ledger
            .balance_of(loan.token, loan.lender)
            .saturating_sub(lender_entry);
        let owed = loan.owed();
        if repaid < owed {
            return Err(ExecutionError::LoanUnrepaid { owed, repaid });
        }
        Ok(RunReport {
            records: captured.len(),
            patched,
            repaid,
        })
    }
}

/// Canonical big-endian word for a captured return: a capture of word size
/// or longer contributes its leading word, a shorter one zero-extends.
fn capture_word(capture: &[u8]) -> [u8; WORD_BYTES] {
    let mut word = [0u8; WORD_BYTES];
    if capture.len() >= WORD_BYTES {
        word.copy_from_slice(&capture[..WORD_BYTES]);
    } else {
        word[WORD_BYTES - capture.len()..].copy_from_slice(capture);
    }
    word
}

/// Overwrites `payload[dest_offset .. dest_offset + WORD_BYTES]` with
/// `word`. Fails without writing a single byte if the slice would leave the
/// payload.
fn apply_patch(payload: &mut [u8], dest_offset: usize, word: &[u8; WORD_BYTES]) -> Result<(), ()> {
    let end = dest_offset.checked_add(WORD_BYTES).ok_or(())?;
    if end > payload.len() {
        return Err(());
    }
    payload[dest_offset..end].copy_from_slice(word);
    Ok(())
}
