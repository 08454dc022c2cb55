//! Wake signals: timers, messages and human tasks.

use weft_execution::WakeSignal;
use weft_storage::ProcessStore;
use weft_vm::Delivery;

use crate::engine::Engine;
use crate::error::EngineError;

impl<S: ProcessStore> Engine<S> {
    /// Deliver a signal to one fiber.
    ///
    /// Stale or mismatched signals are recorded in the event log and
    /// reported as [`Delivery::Discarded`]. A signal for an instance that
    /// has already finished is discarded without touching its log.
    pub async fn signal(&self, signal: WakeSignal) -> Result<Delivery, EngineError> {
        let _guard = self.lock(signal.instance).await;
        self.transact(signal.instance, |vm, batch| {
            let instance = batch.instance();
            if !instance.is_running() {
                let reason = format!("instance is {}", instance.status);
                tracing::debug!(
                    instance = %signal.instance,
                    fiber = %signal.fiber,
                    %reason,
                    "signal for finished instance discarded"
                );
                return Ok(Delivery::Discarded { reason });
            }
            Ok(vm.deliver(batch, &signal)?)
        })
        .await
    }

    /// Deliver a message to every fiber waiting on `name` with this
    /// correlation key. Returns how many were woken.
    pub async fn correlate_message(
        &self,
        name: &str,
        correlation: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<usize, EngineError> {
        let waiters = self.store().find_message_waiters(name, correlation).await?;
        let mut woken = 0;
        for waiter in waiters {
            let mut signal =
                WakeSignal::message(waiter.instance, waiter.fiber, waiter.epoch, name, correlation);
            if let Some(payload) = payload.clone() {
                signal = signal.with_payload(payload);
            }
            if self.signal(signal).await?.is_woken() {
                woken += 1;
            }
        }
        tracing::debug!(name, correlation, woken, "message correlated");
        Ok(woken)
    }

    /// Fire every timer due now. Returns how many fibers were woken.
    ///
    /// A failure on one instance is logged and does not stop the sweep.
    pub async fn fire_due_timers(&self) -> Result<usize, EngineError> {
        let due = self.store().due_timers(self.now()).await?;
        let mut fired = 0;
        for timer in due {
            let signal = WakeSignal::timer(timer.instance, timer.fiber, timer.epoch);
            match self.signal(signal).await {
                Ok(delivery) if delivery.is_woken() => fired += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(instance = %timer.instance, fiber = %timer.fiber, error = %err, "timer delivery failed");
                }
            }
        }
        if fired > 0 {
            tracing::debug!(fired, "timers fired");
        }
        Ok(fired)
    }
}
