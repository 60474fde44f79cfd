//! Provides a per-key coalescer for concurrent loads.
//!
//! When many clients miss the cache for the same key at the same time, only one of
//! them should actually perform the expensive upstream load (peer fetch or origin
//! read) - everybody else should simply wait for that result. This is what
//! [SingleFlight::throttle](SingleFlight::throttle) guarantees: at most one
//! concurrent invocation of the load closure per key, with every concurrent caller
//! observing the same result or error.
//!
//! The internal map is purely a rendezvous structure, not a cache: a record only
//! exists while a load is in flight and is removed as soon as the load completes.
//! Serial (non-overlapping) calls therefore always re-invoke the closure.
//!
//! # Example
//! ```
//! # use callisto::singleflight::SingleFlight;
//! # #[tokio::main]
//! # async fn main() {
//! let flights: SingleFlight<i32> = SingleFlight::new();
//!
//! let result = flights.throttle("answer", || async { Ok(42) }).await.unwrap();
//! assert_eq!(result, 42);
//! # }
//! ```
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// An error observed by every caller of a coalesced load.
///
/// As the same error has to be handed to an arbitrary number of waiters (and
/// `anyhow::Error` cannot be cloned), the underlying error is shared behind an
/// `Arc`. The original message and source chain remain fully intact - wrapping a
/// **SharedError** back into an `anyhow::Error` surfaces the loader's error
/// verbatim.
#[derive(Clone, Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    fn new(error: anyhow::Error) -> Self {
        SharedError(Arc::new(error))
    }
}

impl Display for SharedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref().as_ref())
    }
}

/// The rendezvous object shared between the leading caller and its followers.
type Flight<V> = watch::Receiver<Option<Result<V, SharedError>>>;

/// The role a caller ends up with after consulting the flight map.
enum Role<V> {
    /// This caller performs the load and publishes the result.
    Leader(watch::Sender<Option<Result<V, SharedError>>>),
    /// This caller waits for the result of an in-flight load.
    Follower(Flight<V>),
}

/// Coalesces concurrent invocations per string key.
///
/// See the [module docs](crate::singleflight) for the full contract.
pub struct SingleFlight<V> {
    flights: Mutex<HashMap<String, Flight<V>>>,
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

/// Removes the flight record once the leading call is finished.
///
/// This lives in a drop guard so that the record also disappears if the leader is
/// cancelled mid-load. Followers of such an abandoned flight observe a closed
/// channel and report an error; the next caller starts a fresh flight.
struct FlightGuard<'a, V> {
    flights: &'a Mutex<HashMap<String, Flight<V>>>,
    key: String,
}

impl<'a, V> Drop for FlightGuard<'a, V> {
    fn drop(&mut self) {
        let _ = self.flights.lock().unwrap().remove(&self.key);
    }
}

impl<V: Clone> SingleFlight<V> {
    /// Creates a new coalescer.
    pub fn new() -> Self {
        SingleFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Invokes **load** unless a load for the same key is already in flight, in
    /// which case the in-flight result is awaited and shared.
    ///
    /// The internal lock is never held while **load** runs. Once the load
    /// completes, its result is published to all waiters, the flight record is
    /// removed, and the result is returned. Callers arriving after the removal
    /// trigger a fresh invocation.
    pub async fn throttle<F, Fut>(&self, key: &str, load: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let role = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key).cloned() {
                // Somebody else is already loading this key - become a follower
                // of their flight...
                Some(flight) => Role::Follower(flight),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let _ = flights.insert(key.to_owned(), rx);
                    Role::Leader(tx)
                }
            }
        };

        let leader_tx = match role {
            Role::Follower(flight) => return await_flight(flight).await,
            Role::Leader(tx) => tx,
        };

        // We are the leader: perform the load without holding the map lock, then
        // publish the result and remove the record (in that order - followers
        // which grabbed the receiver before the removal still observe the value).
        let guard = FlightGuard {
            flights: &self.flights,
            key: key.to_owned(),
        };

        let result = load().await.map_err(SharedError::new);
        let _ = leader_tx.send(Some(result.clone()));
        drop(guard);

        result
    }
}

/// Awaits the result published by the leading caller.
async fn await_flight<V: Clone>(mut flight: Flight<V>) -> Result<V, SharedError> {
    loop {
        if let Some(result) = flight.borrow().clone() {
            return result;
        }

        if flight.changed().await.is_err() {
            // The sender is gone. Either the result was published right before
            // (then it is visible now), or the leader was cancelled without ever
            // producing one...
            let result = flight.borrow().clone();
            return result.unwrap_or_else(|| {
                Err(SharedError::new(anyhow::anyhow!(
                    "The coalesced load was abandoned before producing a result"
                )))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SingleFlight;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    #[test]
    fn concurrent_callers_share_a_single_invocation() {
        test_async(async {
            let flights: Arc<SingleFlight<usize>> = Arc::new(SingleFlight::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            // Fire 100 concurrent calls for the same key. The load takes 50ms,
            // which is plenty for all of them to pile up behind the first one...
            let mut handles = Vec::new();
            for _ in 0..100 {
                let flights = flights.clone();
                let invocations = invocations.clone();
                handles.push(tokio::spawn(async move {
                    flights
                        .throttle("myKey", || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1)
                        })
                        .await
                        .unwrap()
                }));
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap(), 1);
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn serial_callers_reload() {
        test_async(async {
            let flights: SingleFlight<usize> = SingleFlight::new();
            let invocations = AtomicUsize::new(0);

            for expected in 1..=3 {
                let result = flights
                    .throttle("myKey", || async {
                        Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await
                    .unwrap();
                assert_eq!(result, expected);
            }

            assert_eq!(invocations.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        test_async(async {
            let flights: SingleFlight<usize> = SingleFlight::new();
            let invocations = AtomicUsize::new(0);

            let first = flights
                .throttle("left", || async {
                    Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();
            let second = flights
                .throttle("right", || async {
                    Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();

            assert_eq!((first, second), (1, 2));
        });
    }

    #[test]
    fn errors_are_shared_with_all_waiters() {
        test_async(async {
            let flights: Arc<SingleFlight<usize>> = Arc::new(SingleFlight::new());

            let mut handles = Vec::new();
            for _ in 0..10 {
                let flights = flights.clone();
                handles.push(tokio::spawn(async move {
                    flights
                        .throttle("myKey", || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(anyhow::anyhow!("origin exploded"))
                        })
                        .await
                }));
            }

            for handle in handles {
                let error = handle.await.unwrap().unwrap_err();
                assert_eq!(error.to_string().contains("origin exploded"), true);
            }

            // The record is gone, a subsequent call re-invokes and may succeed...
            let result = flights.throttle("myKey", || async { Ok(42) }).await.unwrap();
            assert_eq!(result, 42);
        });
    }
}
