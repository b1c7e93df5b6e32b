//! A scriptable [`ChangeNotifier`] that records everything the coordinator
//! does to it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use ember_coord::{ChangeNotifier, Handle};
use ember_error::EmberError;
use ember_store::{ListChangeInfo, ReadTransaction, TransactionChangeInfo};
use ember_types::{ChangeSet, RowKey, VersionId};

/// One delivered (or deliverable) batch of results.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The version the results are based on.
    pub version: Option<VersionId>,
    /// Per observed table: the aggregate diff since the previous delivery.
    pub tables: Vec<(usize, ChangeSet)>,
    /// Per observed list, in registration order.
    pub lists: Vec<ChangeSet>,
    /// Set when a latched background error was handed over instead.
    pub error: Option<String>,
}

struct ListObserver {
    table: usize,
    column: usize,
    row: RowKey,
    changes: Arc<Mutex<ChangeSet>>,
}

#[derive(Default)]
struct NotifierState {
    version: Option<VersionId>,
    attached: Option<Arc<dyn ReadTransaction>>,
    run_result: Option<Vec<(usize, ChangeSet)>>,
    handover: Option<Delivery>,
    pending: Vec<Delivery>,
    delivered: Vec<Delivery>,
    runs: usize,
    released: bool,
}

type CallbackHook = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Observes a fixed set of tables (and optionally lists) through one handle,
/// recording run counts, handovers, and callback deliveries for assertions.
pub struct RecordingNotifier {
    handle: Weak<Handle>,
    tables: Vec<usize>,
    lists: Vec<ListObserver>,
    state: Mutex<NotifierState>,
    on_callback: Mutex<Option<CallbackHook>>,
}

impl RecordingNotifier {
    /// A notifier observing `tables`, originating at `handle`'s current
    /// snapshot.
    pub fn new(handle: &Arc<Handle>, tables: &[usize]) -> Arc<Self> {
        Self::with_lists(handle, tables, &[])
    }

    /// As [`new`](Self::new), additionally observing the given
    /// `(table, column, row)` lists.
    pub fn with_lists(
        handle: &Arc<Handle>,
        tables: &[usize],
        lists: &[(usize, usize, RowKey)],
    ) -> Arc<Self> {
        Arc::new(Self {
            handle: Arc::downgrade(handle),
            tables: tables.to_vec(),
            lists: lists
                .iter()
                .map(|&(table, column, row)| ListObserver {
                    table,
                    column,
                    row,
                    changes: Arc::new(Mutex::new(ChangeSet::new())),
                })
                .collect(),
            state: Mutex::new(NotifierState {
                version: handle.current_version(),
                ..NotifierState::default()
            }),
            on_callback: Mutex::new(None),
        })
    }

    /// Install a hook invoked for every delivery handed to callbacks.
    pub fn set_on_callback(&self, hook: impl Fn(&Delivery) + Send + Sync + 'static) {
        *self.on_callback.lock() = Some(Arc::new(hook));
    }

    /// Deliveries whose callbacks have run, oldest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().delivered.clone()
    }

    pub fn run_count(&self) -> usize {
        self.state.lock().runs
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

/// Fold an undelivered older batch into the one replacing it.
fn merge_deliveries(older: Delivery, newer: Delivery) -> Delivery {
    let mut tables = older.tables;
    for (table, changes) in newer.tables {
        match tables.iter_mut().find(|(existing, _)| *existing == table) {
            Some((_, existing)) => existing.merge(&changes),
            None => tables.push((table, changes)),
        }
    }
    let lists = older
        .lists
        .into_iter()
        .zip(newer.lists)
        .map(|(mut old, new)| {
            old.merge(&new);
            old
        })
        .collect();
    Delivery {
        version: newer.version,
        tables,
        lists,
        error: newer.error.or(older.error),
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn version(&self) -> Option<VersionId> {
        self.state.lock().version
    }

    fn handle(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    fn is_alive(&self) -> bool {
        if self.state.lock().released {
            return false;
        }
        self.handle
            .upgrade()
            .is_some_and(|handle| !handle.is_closed())
    }

    fn attach_to(&self, transaction: &Arc<dyn ReadTransaction>) {
        self.state.lock().attached = Some(Arc::clone(transaction));
    }

    fn detach(&self) {
        self.state.lock().attached = None;
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        for &table in &self.tables {
            info.table_mut(table);
        }
        for observer in &self.lists {
            info.lists.push(ListChangeInfo {
                table: observer.table,
                column: observer.column,
                row: observer.row,
                changes: Arc::clone(&observer.changes),
            });
        }
    }

    fn run(&self, info: &TransactionChangeInfo) {
        let mut state = self.state.lock();
        state.runs += 1;
        state.run_result = Some(
            self.tables
                .iter()
                .map(|&table| (table, info.tables.get(table).cloned().unwrap_or_default()))
                .collect(),
        );
    }

    fn prepare_handover(&self) {
        let mut state = self.state.lock();
        let version = state
            .attached
            .as_ref()
            .and_then(|transaction| transaction.current_version());
        let tables = state.run_result.take().unwrap_or_default();
        let lists = self
            .lists
            .iter()
            .map(|observer| {
                let mut changes = observer.changes.lock();
                let snapshot = changes.clone();
                changes.clear();
                snapshot
            })
            .collect();

        let mut delivery = Delivery {
            version,
            tables,
            lists,
            error: None,
        };
        if let Some(previous) = state.handover.take() {
            delivery = merge_deliveries(previous, delivery);
        }
        state.version = version;
        state.handover = Some(delivery);
    }

    fn deliver(&self, transaction: &dyn ReadTransaction, error: Option<Arc<EmberError>>) -> bool {
        // Results belong to this notifier's own handle; delivery attempts
        // against any other handle's transaction are not ours.
        let owns_transaction = self.handle.upgrade().is_some_and(|handle| {
            std::ptr::addr_eq(
                Arc::as_ptr(handle.transaction()),
                std::ptr::from_ref(transaction),
            )
        });
        if !owns_transaction {
            return false;
        }

        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        if let Some(error) = error {
            let version = state.version;
            state.pending.push(Delivery {
                version,
                tables: Vec::new(),
                lists: Vec::new(),
                error: Some(error.to_string()),
            });
            return true;
        }
        let matches = state
            .handover
            .as_ref()
            .is_some_and(|delivery| delivery.version == transaction.current_version());
        if !matches {
            return false;
        }
        let delivery = state.handover.take().expect("matched above");
        state.pending.push(delivery);
        true
    }

    fn call_callbacks(&self) {
        let (pending, hook) = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            state.delivered.extend(pending.iter().cloned());
            (pending, self.on_callback.lock().clone())
        };
        if let Some(hook) = hook {
            for delivery in &pending {
                hook(delivery);
            }
        }
    }

    fn release_data(&self) {
        let mut state = self.state.lock();
        state.released = true;
        state.attached = None;
        state.handover = None;
        state.run_result = None;
        state.pending.clear();
    }
}
