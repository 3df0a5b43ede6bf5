use std::fmt;

use slab::Slab;
use tracing::warn;

use crate::{Error, Result};

use super::Token;

struct Entry<T> {
    sequence: u32,
    value: T,
}

/// An arena of outstanding requests keyed by [Token].
///
/// Requests are registered before their operation is prepared and removed once the matching
/// completion is resolved, so a token maps to at most one request at any time. Looking up a token
/// that isn't registered, whether it was never handed out, already removed or belongs to a
/// previous occupant of the same slot, fails with [Error::UnknownCorrelation].
pub struct CorrelationTable<T> {
    entries: Slab<Entry<T>>,
    sequence: u32,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> CorrelationTable<T> {
        CorrelationTable::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> CorrelationTable<T> {
        CorrelationTable {
            entries: Slab::with_capacity(capacity),
            sequence: 0,
        }
    }

    /// Take ownership of `value` and return the token it is registered under.
    pub fn register(&mut self, value: T) -> Token {
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let index = self.entries.insert(Entry { sequence, value });
        assert!(
            index <= u32::MAX as usize,
            "correlation table exceeded {} entries",
            u32::MAX
        );
        Token::new(index as u32, sequence)
    }

    fn lookup(&self, token: Token) -> Option<&Entry<T>> {
        self.entries
            .get(token.index())
            .filter(|entry| entry.sequence == token.sequence())
    }

    pub fn contains(&self, token: Token) -> bool {
        self.lookup(token).is_some()
    }

    pub fn get(&self, token: Token) -> Result<&T> {
        self.lookup(token)
            .map(|entry| &entry.value)
            .ok_or(Error::UnknownCorrelation(token.as_u64()))
    }

    /// Resolve a token to the request registered under it.
    pub fn resolve(&mut self, token: Token) -> Result<&mut T> {
        match self.entries.get_mut(token.index()) {
            Some(entry) if entry.sequence == token.sequence() => Ok(&mut entry.value),
            _ => {
                warn!(%token, "resolve of unknown correlation token");
                Err(Error::UnknownCorrelation(token.as_u64()))
            }
        }
    }

    /// Deregister a token, handing ownership of its request back to the caller.
    pub fn remove(&mut self, token: Token) -> Result<T> {
        if !self.contains(token) {
            warn!(%token, "remove of unknown correlation token");
            return Err(Error::UnknownCorrelation(token.as_u64()));
        }
        Ok(self.entries.remove(token.index()).value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every token currently registered, in slot order.
    pub fn tokens(&self) -> Vec<Token> {
        self.entries
            .iter()
            .map(|(index, entry)| Token::new(index as u32, entry.sequence))
            .collect()
    }

    /// Iterate mutably over every registered request.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Token, &mut T)> {
        self.entries
            .iter_mut()
            .map(|(index, entry)| (Token::new(index as u32, entry.sequence), &mut entry.value))
    }

    /// Remove every registered request.
    pub fn drain(&mut self) -> Vec<(Token, T)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(index, entry)| (Token::new(index as u32, entry.sequence), entry.value))
            .collect()
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        CorrelationTable::new()
    }
}

impl<T> fmt::Debug for CorrelationTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("len", &self.entries.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_remove() {
        let mut table = CorrelationTable::new();
        let a = table.register("a");
        let b = table.register("b");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert_eq!(*table.resolve(b).unwrap(), "b");
        assert_eq!(*table.resolve(a).unwrap(), "a");
        assert_eq!(table.remove(a).unwrap(), "a");
        assert_eq!(table.len(), 1);
        assert!(!table.contains(a));
    }

    #[test]
    fn test_unknown_token() {
        let mut table: CorrelationTable<u32> = CorrelationTable::new();
        let raw = Token::from_raw(0x1234);
        assert!(matches!(
            table.resolve(raw),
            Err(Error::UnknownCorrelation(0x1234))
        ));
        assert!(matches!(table.remove(raw), Err(Error::UnknownCorrelation(_))));
    }

    #[test]
    fn test_double_remove_is_detected() {
        let mut table = CorrelationTable::new();
        let token = table.register(1);
        table.remove(token).unwrap();
        assert!(matches!(
            table.remove(token),
            Err(Error::UnknownCorrelation(_))
        ));
    }

    #[test]
    fn test_stale_token_after_slot_reuse() {
        let mut table = CorrelationTable::new();
        let old = table.register("old");
        table.remove(old).unwrap();

        let new = table.register("new");
        // Same slot, different sequence.
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(table.resolve(old).is_err());
        assert_eq!(*table.resolve(new).unwrap(), "new");
    }

    #[test]
    fn test_raw_round_trip() {
        let mut table = CorrelationTable::new();
        let token = table.register(7u8);
        let raw: u64 = token.into();
        assert_eq!(*table.get(Token::from_raw(raw)).unwrap(), 7);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = CorrelationTable::new();
        let tokens: Vec<_> = (0..5).map(|i| table.register(i)).collect();
        assert_eq!(table.tokens(), tokens);

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert!(table.is_empty());
        for (token, value) in drained {
            assert_eq!(tokens[value], token);
        }
    }

    #[test]
    fn test_sequence_survives_drain() {
        let mut table = CorrelationTable::new();
        let first = table.register(());
        table.drain();
        let second = table.register(());
        assert!(second.sequence() > first.sequence());
    }
}
