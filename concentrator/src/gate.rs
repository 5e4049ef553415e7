// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! One-shot readiness gates for freshly reserved devices.
//!
//! A reservation in the topology store is made before the kernel device
//! exists. The caller that created the reservation performs the (slow)
//! kernel work and then settles the gate; concurrent callers that found the
//! reservation already present wait on the gate instead of racing the
//! creation. Terminal states are write-once: once settled, a gate never
//! changes, and the index it carries is final.

use net::InterfaceIndex;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum GateState {
    Pending,
    Ready(InterfaceIndex),
    Failed,
}

/// Why a wait on a gate did not produce a device index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum GateError {
    /// The creator released the gate without a device behind it.
    Failed,
    /// The bounded wait elapsed.
    Timeout,
}

#[derive(Debug)]
pub(crate) struct DeviceGate {
    tx: watch::Sender<GateState>,
}

impl DeviceGate {
    /// A gate awaiting its creator.
    pub(crate) fn pending() -> Self {
        Self {
            tx: watch::channel(GateState::Pending).0,
        }
    }

    /// A gate born settled, for devices observed live during rebuild.
    pub(crate) fn ready(index: InterfaceIndex) -> Self {
        Self {
            tx: watch::channel(GateState::Ready(index)).0,
        }
    }

    /// Settle the gate with the device's final index. No-op if already
    /// settled.
    pub(crate) fn complete(&self, index: InterfaceIndex) {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = GateState::Ready(index);
                true
            } else {
                false
            }
        });
    }

    /// Release waiters without a device. No-op if already settled.
    pub(crate) fn fail(&self) {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = GateState::Failed;
                true
            } else {
                false
            }
        });
    }

    /// Wait (bounded) for the gate to settle and return the device index.
    pub(crate) async fn wait(&self, limit: Duration) -> Result<InterfaceIndex, GateError> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(
            limit,
            rx.wait_for(|state| *state != GateState::Pending),
        )
        .await;
        match settled {
            Err(_) => Err(GateError::Timeout),
            Ok(Err(_)) => Err(GateError::Failed),
            Ok(Ok(state)) => match *state {
                GateState::Ready(index) => Ok(index),
                _ => Err(GateError::Failed),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(200);

    fn index(raw: u32) -> InterfaceIndex {
        InterfaceIndex::try_new(raw).unwrap()
    }

    #[tokio::test]
    async fn wait_after_complete() {
        let gate = DeviceGate::pending();
        gate.complete(index(7));
        assert_eq!(gate.wait(WAIT).await, Ok(index(7)));
    }

    #[tokio::test]
    async fn wait_before_complete() {
        let gate = Arc::new(DeviceGate::pending());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(WAIT).await })
        };
        tokio::task::yield_now().await;
        gate.complete(index(3));
        assert_eq!(waiter.await.unwrap(), Ok(index(3)));
    }

    #[tokio::test]
    async fn failure_releases_waiters() {
        let gate = Arc::new(DeviceGate::pending());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(WAIT).await })
        };
        tokio::task::yield_now().await;
        gate.fail();
        assert_eq!(waiter.await.unwrap(), Err(GateError::Failed));
    }

    #[tokio::test]
    async fn pending_gate_times_out() {
        let gate = DeviceGate::pending();
        assert_eq!(
            gate.wait(Duration::from_millis(10)).await,
            Err(GateError::Timeout)
        );
    }

    #[tokio::test]
    async fn settled_state_is_final() {
        let gate = DeviceGate::pending();
        gate.complete(index(9));
        gate.fail();
        gate.complete(index(11));
        assert_eq!(gate.wait(WAIT).await, Ok(index(9)));

        let gate = DeviceGate::ready(index(4));
        gate.fail();
        assert_eq!(gate.wait(WAIT).await, Ok(index(4)));
    }
}
