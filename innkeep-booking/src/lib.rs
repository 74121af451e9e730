pub mod orchestrator;
pub mod outbox;
pub mod reconcile;

pub use orchestrator::{BookingOrchestrator, InitiateBooking, PaymentHandle, SagaSettings, Settlement};
pub use outbox::{DispatchReport, OutboxDispatcher};
pub use reconcile::{ReconcileReport, Reconciler};
