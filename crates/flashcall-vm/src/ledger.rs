//! Journaled token ledger.
//!
//! A host transaction either lands every balance mutation or none of
//! them. That boundary is explicit here: every mutation appends an undo
//! entry, and a unit of work is a checkpoint that can be rolled back to
//! in reverse order.

use std::collections::BTreeMap;

use flashcall_wire::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InsufficientFunds {
        token: Option<Address>,
        holder: Address,
        needed: u128,
        available: u128,
    },
    BalanceOverflow {
        token: Option<Address>,
        holder: Address,
    },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientFunds {
                token,
                holder,
                needed,
                available,
            } => match token {
                Some(token) => write!(
                    f,
                    "insufficient balance of token {token} for {holder}: need {needed}, have {available}"
                ),
                None => write!(
                    f,
                    "insufficient native balance for {holder}: need {needed}, have {available}"
                ),
            },
            LedgerError::BalanceOverflow { token, holder } => match token {
                Some(token) => write!(f, "balance overflow for {holder} in token {token}"),
                None => write!(f, "native balance overflow for {holder}"),
            },
        }
    }
}

impl std::error::Error for LedgerError {}

/// Position in the undo journal. Rolling back to a checkpoint undoes every
/// mutation recorded after it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Clone)]
enum Undo {
    Token {
        token: Address,
        holder: Address,
        prev: u128,
    },
    Native {
        holder: Address,
        prev: u128,
    },
}

/// Token and native-currency balances with an undo journal.
///
/// Checkpoints nest: an inner unit of work rolls back without disturbing
/// entries an outer one still needs, so only the outermost caller may
/// [`commit`](TokenLedger::commit).
#[derive(Debug, Default, Clone)]
pub struct TokenLedger {
    tokens: BTreeMap<(Address, Address), u128>,
    native: BTreeMap<Address, u128>,
    journal: Vec<Undo>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, token: Address, holder: Address) -> u128 {
        self.tokens.get(&(token, holder)).copied().unwrap_or(0)
    }

    pub fn native_balance_of(&self, holder: Address) -> u128 {
        self.native.get(&holder).copied().unwrap_or(0)
    }

    pub fn mint(&mut self, token: Address, to: Address, amount: u128) -> Result<(), LedgerError> {
        let prev = self.balance_of(token, to);
        let next = prev.checked_add(amount).ok_or(LedgerError::BalanceOverflow {
            token: Some(token),
            holder: to,
        })?;
        self.set_token(token, to, prev, next);
        Ok(())
    }

    pub fn mint_native(&mut self, to: Address, amount: u128) -> Result<(), LedgerError> {
        let prev = self.native_balance_of(to);
        let next = prev.checked_add(amount).ok_or(LedgerError::BalanceOverflow {
            token: None,
            holder: to,
        })?;
        self.set_native(to, prev, next);
        Ok(())
    }

    pub fn transfer(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), LedgerError> {
        let from_prev = self.balance_of(token, from);
        if from_prev < amount {
            return Err(LedgerError::InsufficientFunds {
                token: Some(token),
                holder: from,
                needed: amount,
                available: from_prev,
            });
        }
        // Self-transfer must not double-apply through stale reads.
        if from == to {
            return Ok(());
        }
        let to_prev = self.balance_of(token, to);
        let to_next = to_prev
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow {
                token: Some(token),
                holder: to,
            })?;
        self.set_token(token, from, from_prev, from_prev - amount);
        self.set_token(token, to, to_prev, to_next);
        Ok(())
    }

    pub fn transfer_native(
        &mut self,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), LedgerError> {
        let from_prev = self.native_balance_of(from);
        if from_prev < amount {
            return Err(LedgerError::InsufficientFunds {
                token: None,
                holder: from,
                needed: amount,
                available: from_prev,
            });
        }
        if from == to {
            return Ok(());
        }
        let to_prev = self.native_balance_of(to);
        let to_next = to_prev
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow {
                token: None,
                holder: to,
            })?;
        self.set_native(from, from_prev, from_prev - amount);
        self.set_native(to, to_prev, to_next);
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    /// Undoes every mutation recorded after `cp`, newest first.
    pub fn rollback_to(&mut self, cp: Checkpoint) {
        while self.journal.len() > cp.0 {
            match self.journal.pop() {
                Some(Undo::Token { token, holder, prev }) => {
                    if prev == 0 {
                        self.tokens.remove(&(token, holder));
                    } else {
                        self.tokens.insert((token, holder), prev);
                    }
                }
                Some(Undo::Native { holder, prev }) => {
                    if prev == 0 {
                        self.native.remove(&holder);
                    } else {
                        self.native.insert(holder, prev);
                    }
                }
                None => break,
            }
        }
    }

    /// Discards undo history recorded since `cp`. Only valid for the
    /// outermost unit of work; inner callers must leave their entries for
    /// the enclosing checkpoint to roll back.
    pub fn commit(&mut self, cp: Checkpoint) {
        self.journal.truncate(cp.0);
    }

    fn set_token(&mut self, token: Address, holder: Address, prev: u128, next: u128) {
        self.journal.push(Undo::Token { token, holder, prev });
        self.tokens.insert((token, holder), next);
    }

    fn set_native(&mut self, holder: Address, prev: u128, next: u128) {
        self.journal.push(Undo::Native { holder, prev });
        self.native.insert(holder, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        let mut a = [0u8; flashcall_wire::ADDRESS_BYTES];
        a[flashcall_wire::ADDRESS_BYTES - 1] = last;
        Address(a)
    }

    #[test]
    fn mint_and_transfer_move_balances() {
        let token = addr(1);
        let (a, b) = (addr(2), addr(3));
        let mut ledger = TokenLedger::new();
        ledger.mint(token, a, 100).unwrap();
        ledger.transfer(token, a, b, 40).unwrap();
        assert_eq!(ledger.balance_of(token, a), 60);
        assert_eq!(ledger.balance_of(token, b), 40);
    }

    #[test]
    fn transfer_rejects_insufficient_funds_without_effect() {
        let token = addr(1);
        let (a, b) = (addr(2), addr(3));
        let mut ledger = TokenLedger::new();
        ledger.mint(token, a, 10).unwrap();
        let err = ledger.transfer(token, a, b, 11).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance_of(token, a), 10);
        assert_eq!(ledger.balance_of(token, b), 0);
    }

    #[test]
    fn rollback_undoes_mutations_in_reverse() {
        let token = addr(1);
        let (a, b) = (addr(2), addr(3));
        let mut ledger = TokenLedger::new();
        ledger.mint(token, a, 100).unwrap();
        ledger.mint_native(a, 5).unwrap();

        let cp = ledger.checkpoint();
        ledger.transfer(token, a, b, 70).unwrap();
        ledger.transfer_native(a, b, 5).unwrap();
        ledger.mint(token, b, 1).unwrap();
        ledger.rollback_to(cp);

        assert_eq!(ledger.balance_of(token, a), 100);
        assert_eq!(ledger.balance_of(token, b), 0);
        assert_eq!(ledger.native_balance_of(a), 5);
        assert_eq!(ledger.native_balance_of(b), 0);
    }

    #[test]
    fn nested_checkpoints_roll_back_independently() {
        let token = addr(1);
        let a = addr(2);
        let mut ledger = TokenLedger::new();

        let outer = ledger.checkpoint();
        ledger.mint(token, a, 10).unwrap();
        let inner = ledger.checkpoint();
        ledger.mint(token, a, 5).unwrap();
        ledger.rollback_to(inner);
        assert_eq!(ledger.balance_of(token, a), 10);

        ledger.rollback_to(outer);
        assert_eq!(ledger.balance_of(token, a), 0);
    }

    #[test]
    fn commit_keeps_effects_and_drops_history() {
        let token = addr(1);
        let a = addr(2);
        let mut ledger = TokenLedger::new();
        let cp = ledger.checkpoint();
        ledger.mint(token, a, 10).unwrap();
        ledger.commit(cp);
        // Rolling back to the same point after commit is a no-op.
        ledger.rollback_to(cp);
        assert_eq!(ledger.balance_of(token, a), 10);
    }

    #[test]
    fn self_transfer_is_a_no_op() {
        let token = addr(1);
        let a = addr(2);
        let mut ledger = TokenLedger::new();
        ledger.mint(token, a, 10).unwrap();
        ledger.transfer(token, a, a, 10).unwrap();
        assert_eq!(ledger.balance_of(token, a), 10);
    }
}
