use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::AtxResult;
use crate::types::AtxId;

/// Outcome fanned out to waiters. Owners keep the richer processing result;
/// waiters only learn whether the ATX was accepted.
pub type Outcome = AtxResult<()>;

/// Role assigned to a caller by [`InFlight::begin`].
pub enum Begin {
    /// First arrival: run the validation and call [`InFlight::finish`].
    Owner,
    /// Someone else is already validating this id; await their result.
    Waiter(oneshot::Receiver<Outcome>),
}

/// Tracks ATX ids that are currently being processed so concurrent arrivals
/// of the same ATX trigger the expensive verification only once.
///
/// The lock is held only to insert or remove an entry, never across
/// validation. Entries live from the first `begin` until the owner's
/// `finish`; arrivals after that become owners of a fresh run and
/// short-circuit on the store existence check.
#[derive(Default)]
pub struct InFlight {
    map: Mutex<HashMap<AtxId, Vec<oneshot::Sender<Outcome>>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, id: AtxId) -> Begin {
        let mut map = self.map.lock();
        match map.get_mut(&id) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Begin::Waiter(rx)
            }
            None => {
                map.insert(id, Vec::new());
                Begin::Owner
            }
        }
    }

    /// Broadcasts the owner's outcome to every waiter and removes the entry.
    /// Waiters whose receiving side is gone are skipped.
    pub fn finish(&self, id: AtxId, outcome: &Outcome) {
        let waiters = self.map.lock().remove(&id).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AtxError;

    #[tokio::test]
    async fn waiters_observe_the_owner_outcome() {
        let inflight = InFlight::new();
        let id = AtxId([1u8; 32]);

        assert!(matches!(inflight.begin(id), Begin::Owner));
        let first = match inflight.begin(id) {
            Begin::Waiter(rx) => rx,
            Begin::Owner => panic!("second arrival must wait"),
        };
        let second = match inflight.begin(id) {
            Begin::Waiter(rx) => rx,
            Begin::Owner => panic!("third arrival must wait"),
        };

        inflight.finish(id, &Err(AtxError::Known(id)));
        assert_eq!(first.await.unwrap(), Err(AtxError::Known(id)));
        assert_eq!(second.await.unwrap(), Err(AtxError::Known(id)));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn late_arrival_becomes_a_fresh_owner() {
        let inflight = InFlight::new();
        let id = AtxId([2u8; 32]);

        assert!(matches!(inflight.begin(id), Begin::Owner));
        inflight.finish(id, &Ok(()));
        assert!(matches!(inflight.begin(id), Begin::Owner));
        inflight.finish(id, &Ok(()));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_disturb_the_rest() {
        let inflight = InFlight::new();
        let id = AtxId([3u8; 32]);

        assert!(matches!(inflight.begin(id), Begin::Owner));
        let cancelled = match inflight.begin(id) {
            Begin::Waiter(rx) => rx,
            Begin::Owner => panic!("expected waiter"),
        };
        let surviving = match inflight.begin(id) {
            Begin::Waiter(rx) => rx,
            Begin::Owner => panic!("expected waiter"),
        };
        drop(cancelled);

        inflight.finish(id, &Ok(()));
        assert_eq!(surviving.await.unwrap(), Ok(()));
        assert!(inflight.is_empty());
    }

    #[test]
    fn distinct_ids_do_not_share_entries() {
        let inflight = InFlight::new();
        assert!(matches!(inflight.begin(AtxId([4u8; 32])), Begin::Owner));
        assert!(matches!(inflight.begin(AtxId([5u8; 32])), Begin::Owner));
        assert!(!inflight.is_empty());
    }
}
