use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[cfg(feature = "rkyv-support")]
use bytecheck::CheckBytes;
#[cfg(feature = "rkyv-support")]
use rkyv::{Archive, Deserialize, Serialize};

/// A transaction identifier as assigned by the leader's transaction log.
pub type TxId = u64;

/// The causal context attached to every replicated write.
///
/// Two contexts are only equal when *all* five fields match, a context
/// from the same session but a different machine (or a different event)
/// is a different request and must never be merged with another one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(C)]
#[cfg_attr(feature = "rkyv-support", derive(Serialize, Deserialize, Archive))]
#[cfg_attr(feature = "rkyv-support", archive(compare(PartialEq)))]
#[cfg_attr(feature = "rkyv-support", archive_attr(derive(CheckBytes, Debug)))]
pub struct RequestContext {
    session_id: u64,
    machine_id: u64,
    event_identifier: u64,
    last_applied_tx_id: TxId,
    checksum: u64,
}

impl RequestContext {
    pub fn new(
        session_id: u64,
        machine_id: u64,
        event_identifier: u64,
        last_applied_tx_id: TxId,
        checksum: u64,
    ) -> Self {
        Self {
            session_id,
            machine_id,
            event_identifier,
            last_applied_tx_id,
            checksum,
        }
    }

    #[inline]
    /// The logical client session, stable across reconnects.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[inline]
    /// The member which originated the request.
    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }

    #[inline]
    /// The per-originator counter used to spot duplicate and out-of-order retries.
    pub fn event_identifier(&self) -> u64 {
        self.event_identifier
    }

    #[inline]
    /// The highest transaction the requester had observed when the context was created.
    pub fn last_applied_tx_id(&self) -> TxId {
        self.last_applied_tx_id
    }

    #[inline]
    /// The checksum of `last_applied_tx_id` as seen by the requester.
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    #[inline]
    /// The key the leader uses to group contexts belonging to the same session.
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            session_id: self.session_id,
            machine_id: self.machine_id,
        }
    }

    /// Validates the context against the transaction the target operation requires
    /// the caller to have observed.
    pub fn validate(&self, required_tx_id: TxId) -> Freshness {
        if self.last_applied_tx_id < required_tx_id {
            Freshness::Stale {
                observed: self.last_applied_tx_id,
                required: required_tx_id,
            }
        } else {
            Freshness::Fresh
        }
    }
}

impl Display for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{:0>8X}",
            self.session_id,
            self.machine_id,
            self.event_identifier,
            self.last_applied_tx_id,
            self.checksum,
        )
    }
}

impl FromStr for RequestContext {
    type Err = InvalidContext;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut splits = s.splitn(5, '-');
        let mut next_u64 = || {
            splits
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(InvalidContext)
        };

        let session_id = next_u64()?;
        let machine_id = next_u64()?;
        let event_identifier = next_u64()?;
        let last_applied_tx_id = next_u64()?;
        let checksum = splits
            .next()
            .and_then(|v| u64::from_str_radix(v, 16).ok())
            .ok_or(InvalidContext)?;

        Ok(Self::new(
            session_id,
            machine_id,
            event_identifier,
            last_applied_tx_id,
            checksum,
        ))
    }
}

#[derive(Debug, Copy, Clone, thiserror::Error)]
#[error("The provided string is not a valid request context.")]
pub struct InvalidContext;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
/// Identifies a session on a specific originating member.
pub struct SessionKey {
    pub session_id: u64,
    pub machine_id: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The outcome of validating a context.
pub enum Freshness {
    /// The context reflects everything the session has done so far.
    Fresh,
    /// The session has moved past what the caller observed.
    Stale { observed: TxId, required: TxId },
}

impl Freshness {
    #[inline]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_context_equality_uses_all_fields() {
        // Different machine ids
        assert_ne!(
            RequestContext::new(1234, 1, 2, 0, 0),
            RequestContext::new(1234, 2, 2, 0, 0),
        );

        // Different event identifiers
        assert_ne!(
            RequestContext::new(1234, 1, 10, 0, 0),
            RequestContext::new(1234, 1, 20, 0, 0),
        );

        // Different session ids
        assert_ne!(
            RequestContext::new(1001, 1, 5, 0, 0),
            RequestContext::new(1101, 1, 5, 0, 0),
        );

        // Different checksums
        assert_ne!(
            RequestContext::new(1001, 1, 5, 7, 1),
            RequestContext::new(1001, 1, 5, 7, 2),
        );

        // Same everything
        assert_eq!(
            RequestContext::new(12345, 4, 9, 0, 0),
            RequestContext::new(12345, 4, 9, 0, 0),
        );
    }

    #[test]
    fn test_context_hashing_keeps_partial_matches_apart() {
        let mut contexts = HashSet::new();
        contexts.insert(RequestContext::new(1, 1, 7, 100, 0));
        contexts.insert(RequestContext::new(1, 1, 8, 100, 0));
        contexts.insert(RequestContext::new(1, 2, 7, 100, 0));
        contexts.insert(RequestContext::new(1, 1, 7, 100, 0));

        assert_eq!(contexts.len(), 3);
    }

    #[test]
    fn test_validate() {
        let ctx = RequestContext::new(1, 1, 7, 100, 0);
        assert_eq!(ctx.validate(100), Freshness::Fresh);
        assert_eq!(ctx.validate(42), Freshness::Fresh);
        assert_eq!(
            ctx.validate(101),
            Freshness::Stale {
                observed: 100,
                required: 101
            }
        );
    }

    #[test]
    fn test_display_and_parse() {
        let ctx = RequestContext::new(10, 11, 12, 13, 14);
        let rendered = ctx.to_string();
        assert_eq!(rendered, "10-11-12-13-0000000E");

        let parsed = rendered.parse::<RequestContext>().expect("Parse context");
        assert_eq!(parsed, ctx);

        assert!("10-11-12".parse::<RequestContext>().is_err());
        assert!("a-b-c-d-e".parse::<RequestContext>().is_err());
    }
}
