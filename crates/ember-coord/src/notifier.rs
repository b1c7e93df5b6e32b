//! The background-notifier contract consumed by the coordinator.

use std::sync::Arc;

use ember_error::EmberError;
use ember_store::{ReadTransaction, TransactionChangeInfo};
use ember_types::VersionId;

use crate::handle::Handle;

/// A long-lived observer that diffs a query or collection across versions
/// and fires callbacks on its handle's thread.
///
/// The coordinator owns the advance/deliver lifecycle; implementations own
/// the diff computation and the user callbacks. Methods take `&self` with
/// interior mutability because a notifier is shared between the coordinator's
/// worker and the handle's thread.
pub trait ChangeNotifier: Send + Sync {
    /// The snapshot the notifier's pending results are based on: the origin
    /// snapshot before the first advance, the version of the most recently
    /// prepared results after. `None` when no results are pending.
    fn version(&self) -> Option<VersionId>;

    /// The handle this notifier observes through. Used during registration
    /// to resolve the owning coordinator; `None` once the handle is gone.
    fn handle(&self) -> Option<Arc<Handle>>;

    /// Whether the notifier still has a live consumer.
    fn is_alive(&self) -> bool;

    /// Bind to `transaction`; later calls to [`run`](Self::run) compute
    /// diffs against its snapshot.
    fn attach_to(&self, transaction: &Arc<dyn ReadTransaction>);

    /// Release the binding installed by [`attach_to`](Self::attach_to).
    fn detach(&self);

    /// Declare the tables and lists this notifier needs change data for,
    /// registering accumulators into `info` before an advance.
    fn add_required_change_info(&self, info: &mut TransactionChangeInfo);

    /// Compute this notifier's diff. `info` holds the aggregate changes
    /// between the notifier's previous snapshot and the attached
    /// transaction's current one. Runs with no coordinator lock held.
    fn run(&self, info: &TransactionChangeInfo);

    /// Package the results of the last [`run`](Self::run) for the owning
    /// thread. Called under the coordinator's notifier lock.
    fn prepare_handover(&self);

    /// Attempt delivery against the consumer's current transaction. A
    /// latched background `error` is handed over instead of results.
    /// Returns true if [`call_callbacks`](Self::call_callbacks) should run.
    fn deliver(&self, transaction: &dyn ReadTransaction, error: Option<Arc<EmberError>>) -> bool;

    /// Run user callbacks for delivered results. Called with no coordinator
    /// lock held; re-entering the coordinator is allowed.
    fn call_callbacks(&self);

    /// Drop computed data and transaction bindings so that a dead handle and
    /// its notifiers do not keep each other alive.
    fn release_data(&self);
}
