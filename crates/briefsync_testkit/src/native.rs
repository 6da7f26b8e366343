//! Simulated native engine.
//!
//! A replica file is a JSON document holding the identity header, the
//! records (element id to `Class.property` values), the imported schemas
//! and the pending local transactions. A change-set file is a JSON
//! document with before/after record operations, an optional schema delta
//! and the codes it uses. Every mutation is written through to disk, so
//! the batch applier can work on a closed file and a reopened handle sees
//! the result.
//!
//! Merging with pending local transactions undoes them, applies the
//! incoming change-set and redoes them verbatim, the way a plain native
//! rebase does. Keys moved by an incoming schema change therefore come back
//! under their old name unless the engine rebases semantically.

use briefsync_engine::{LocalChangeSet, NativeEngine, NativeError, NativeReplica, NativeResult};
use briefsync_protocol::{
    ApplyOption, ApplyRequest, ApplyResponse, ApplyStatus, ChangeSet, ChangeSetToken, Code,
    OpenMode, PendingTxn, PropertyValue, RecordChange, ReplicaHeader, ReplicaId, RepositoryId,
    SchemaChange, SchemaDelta, TxnPayload,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Token parent does not match the replica position.
pub const STATUS_WRONG_PARENT: ApplyStatus = ApplyStatus(1);
/// Change-set file missing, unreadable or for another id.
pub const STATUS_BAD_FILE: ApplyStatus = ApplyStatus(2);
/// Failure requested through `SimulatedEngine::fail_apply_of`.
pub const STATUS_INJECTED: ApplyStatus = ApplyStatus(3);
/// Handle closed or read-only.
pub const STATUS_NOT_WRITABLE: ApplyStatus = ApplyStatus(4);

/// Native error codes.
pub mod codes {
    /// Handle is closed.
    pub const CLOSED: i32 = 10;
    /// Handle is read-only.
    pub const READ_ONLY: i32 = 11;
    /// File system failure.
    pub const IO: i32 = 12;
    /// File content is not a replica or change-set.
    pub const CORRUPT: i32 = 13;
    /// No pending transactions to write.
    pub const NOTHING_PENDING: i32 = 14;
    /// Unsaved edits block the operation.
    pub const UNSAVED: i32 = 15;
    /// Reopen failure requested by a test.
    pub const REOPEN: i32 = 16;
    /// Replay failure requested by a test.
    pub const REPLAY: i32 = 17;
}

fn io_error(path: &Path, e: std::io::Error) -> NativeError {
    NativeError::new(codes::IO, format!("{}: {e}", path.display()))
}

fn corrupt(path: &Path, e: serde_json::Error) -> NativeError {
    NativeError::new(codes::CORRUPT, format!("{}: {e}", path.display()))
}

/// Key under which a property value is stored.
pub fn property_key(class: &str, property: &str) -> String {
    format!("{class}.{property}")
}

/// Record values by element id, then by `Class.property`.
pub type Records = BTreeMap<String, BTreeMap<String, Value>>;

fn set_value(records: &mut Records, element: &str, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            records
                .entry(element.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
        None => {
            if let Some(record) = records.get_mut(element) {
                record.remove(key);
                if record.is_empty() {
                    records.remove(element);
                }
            }
        }
    }
}

/// One record write inside a change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOp {
    /// Element id.
    pub element_id: String,
    /// `Class.property` key.
    pub key: String,
    /// Value before the write; `None` if absent.
    pub before: Option<Value>,
    /// Value after the write; `None` deletes.
    pub after: Option<Value>,
}

impl RecordOp {
    /// A write of `value` over `before`.
    pub fn set(
        element_id: impl Into<String>,
        class: &str,
        property: &str,
        before: Option<Value>,
        value: Value,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            key: property_key(class, property),
            before,
            after: Some(value),
        }
    }
}

/// Content of a simulated change-set file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetFile {
    /// Content hash.
    pub id: String,
    /// Parent change-set id.
    pub parent_id: String,
    /// Record writes in order.
    pub ops: Vec<RecordOp>,
    /// Schema changes applied before the record writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDelta>,
    /// Codes the change-set uses.
    #[serde(default)]
    pub codes: Vec<Code>,
}

impl ChangeSetFile {
    /// Builds a change-set and derives its id from the content.
    pub fn new(
        parent_id: impl Into<String>,
        ops: Vec<RecordOp>,
        schema: Option<SchemaDelta>,
        codes: Vec<Code>,
    ) -> Self {
        let parent_id = parent_id.into();
        let mut hasher = Sha256::new();
        hasher.update(parent_id.as_bytes());
        hasher.update(serde_json::to_vec(&(&ops, &schema, &codes)).unwrap_or_default());
        let id = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self {
            id,
            parent_id,
            ops,
            schema,
            codes,
        }
    }

    /// Serialized file content.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Reads a change-set file.
    pub fn read(path: &Path) -> NativeResult<Self> {
        let data = fs::read(path).map_err(|e| io_error(path, e))?;
        serde_json::from_slice(&data).map_err(|e| corrupt(path, e))
    }
}

/// Imported state of one schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaState {
    /// Current version.
    pub version: u32,
    /// Changes imported so far.
    pub changes: Vec<SchemaChange>,
}

/// A committed, unpushed local transaction with its undo information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTxn {
    /// The transaction as reported to the engine.
    pub txn: PendingTxn,
    /// Record writes it made.
    pub ops: Vec<RecordOp>,
}

/// Content of a simulated replica file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaState {
    /// Identity header.
    pub header: ReplicaHeader,
    /// Record values.
    #[serde(default)]
    pub records: Records,
    /// Imported schemas by name.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaState>,
    /// Pending local transactions in commit order.
    #[serde(default)]
    pub local: Vec<LocalTxn>,
    /// Uncommitted edits.
    #[serde(default)]
    pub unsaved: Vec<RecordChange>,
    /// Codes used by uncommitted edits.
    #[serde(default)]
    pub unsaved_codes: Vec<Code>,
    /// Last local transaction id handed out.
    #[serde(default)]
    pub last_txn_id: u64,
    /// Change-set being created, if any.
    #[serde(default)]
    pub creating: Option<String>,
}

impl ReplicaState {
    /// An empty replica before the first change-set.
    pub fn new(repository: RepositoryId, replica: ReplicaId) -> Self {
        Self {
            header: ReplicaHeader {
                repository_id: repository,
                replica_id: replica,
                parent_change_set_id: String::new(),
                reversed_change_set_id: None,
            },
            records: Records::new(),
            schemas: BTreeMap::new(),
            local: Vec::new(),
            unsaved: Vec::new(),
            unsaved_codes: Vec::new(),
            last_txn_id: 0,
            creating: None,
        }
    }

    /// A standalone replica with `files` merged in order.
    pub fn from_history(repository: RepositoryId, files: &[ChangeSetFile]) -> Self {
        let mut state = Self::new(repository, ReplicaId::STANDALONE);
        for file in files {
            state.apply_file(file, true);
            state.header.parent_change_set_id = file.id.clone();
        }
        state
    }

    /// Reads a replica file.
    pub fn load(path: &Path) -> NativeResult<Self> {
        let data = fs::read(path).map_err(|e| io_error(path, e))?;
        serde_json::from_slice(&data).map_err(|e| corrupt(path, e))
    }

    /// Writes the replica file.
    pub fn save(&self, path: &Path) -> NativeResult<()> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| corrupt(path, e))?;
        fs::write(path, data).map_err(|e| io_error(path, e))
    }

    /// Serialized file content.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    /// Id of the change-set the visible content corresponds to.
    pub fn visible_id(&self) -> &str {
        self.header
            .reversed_change_set_id
            .as_deref()
            .unwrap_or(&self.header.parent_change_set_id)
    }

    /// A stored value.
    pub fn value(&self, element: &str, class: &str, property: &str) -> Option<&Value> {
        self.records
            .get(element)
            .and_then(|record| record.get(&property_key(class, property)))
    }

    fn apply_ops(&mut self, ops: &[RecordOp], forward: bool) {
        if forward {
            for op in ops {
                set_value(&mut self.records, &op.element_id, &op.key, op.after.clone());
            }
        } else {
            for op in ops.iter().rev() {
                set_value(&mut self.records, &op.element_id, &op.key, op.before.clone());
            }
        }
    }

    fn rename_key(&mut self, from: &str, to: &str) {
        for record in self.records.values_mut() {
            if let Some(value) = record.remove(from) {
                record.insert(to.to_string(), value);
            }
        }
    }

    fn convert_key(&mut self, key: &str, to: briefsync_protocol::PropertyType) {
        for record in self.records.values_mut() {
            if let Some(value) = record.get_mut(key) {
                *value = to.convert(value).unwrap_or(Value::Null);
            }
        }
    }

    fn apply_schema(&mut self, delta: &SchemaDelta, forward: bool) {
        if forward {
            let mut added = Vec::new();
            {
                let entry = self.schemas.entry(delta.schema.clone()).or_default();
                for change in &delta.changes {
                    if !entry.changes.contains(change) {
                        entry.changes.push(change.clone());
                        added.push(change.clone());
                    }
                }
                entry.version = entry.version.max(delta.version);
            }
            for change in &added {
                match change {
                    SchemaChange::MoveProperty {
                        property,
                        from_class,
                        to_class,
                    } => self.rename_key(
                        &property_key(from_class, property),
                        &property_key(to_class, property),
                    ),
                    SchemaChange::RetypeProperty {
                        class, property, to, ..
                    } => self.convert_key(&property_key(class, property), *to),
                    SchemaChange::AddClass { .. } | SchemaChange::AddProperty { .. } => {}
                }
            }
        } else {
            for change in delta.changes.iter().rev() {
                match change {
                    SchemaChange::MoveProperty {
                        property,
                        from_class,
                        to_class,
                    } => self.rename_key(
                        &property_key(to_class, property),
                        &property_key(from_class, property),
                    ),
                    SchemaChange::RetypeProperty {
                        class,
                        property,
                        from,
                        ..
                    } => self.convert_key(&property_key(class, property), *from),
                    SchemaChange::AddClass { .. } | SchemaChange::AddProperty { .. } => {}
                }
            }
            if let Some(entry) = self.schemas.get_mut(&delta.schema) {
                entry.changes.retain(|c| !delta.changes.contains(c));
                if entry.version == delta.version {
                    entry.version = delta.version.saturating_sub(1);
                }
            }
        }
    }

    fn apply_file(&mut self, file: &ChangeSetFile, forward: bool) {
        if forward {
            if let Some(schema) = &file.schema {
                self.apply_schema(schema, true);
            }
            self.apply_ops(&file.ops, true);
        } else {
            self.apply_ops(&file.ops, false);
            if let Some(schema) = &file.schema {
                self.apply_schema(schema, false);
            }
        }
    }

    fn undo_local(&mut self) {
        let local = std::mem::take(&mut self.local);
        for txn in local.iter().rev() {
            self.apply_ops(&txn.ops, false);
            if let TxnPayload::Schema(delta) = &txn.txn.payload {
                self.apply_schema(delta, false);
            }
        }
        self.local = local;
    }

    fn redo_local(&mut self) {
        let mut local = std::mem::take(&mut self.local);
        for txn in local.iter_mut() {
            if let TxnPayload::Schema(delta) = &txn.txn.payload {
                self.apply_schema(delta, true);
            }
            for op in txn.ops.iter_mut() {
                op.before = self
                    .records
                    .get(&op.element_id)
                    .and_then(|r| r.get(&op.key))
                    .cloned();
                set_value(&mut self.records, &op.element_id, &op.key, op.after.clone());
            }
        }
        self.local = local;
    }

    /// Applies one change-set token to this state.
    pub fn apply_token(&mut self, token: &ChangeSetToken, option: ApplyOption) -> Result<(), ApplyStatus> {
        let file = ChangeSetFile::read(&token.pathname).map_err(|_| STATUS_BAD_FILE)?;
        if file.id != token.id {
            return Err(STATUS_BAD_FILE);
        }
        match option {
            ApplyOption::Merge => {
                if self.header.reversed_change_set_id.is_some()
                    || self.header.parent_change_set_id != token.parent_id
                {
                    return Err(STATUS_WRONG_PARENT);
                }
                self.undo_local();
                self.apply_file(&file, true);
                self.redo_local();
                self.header.parent_change_set_id = token.id.clone();
            }
            ApplyOption::Reverse => {
                if self.visible_id() != token.id {
                    return Err(STATUS_WRONG_PARENT);
                }
                self.apply_file(&file, false);
                self.header.reversed_change_set_id = Some(token.parent_id.clone());
            }
            ApplyOption::Reinstate => {
                if self.header.reversed_change_set_id.is_none() || self.visible_id() != token.parent_id {
                    return Err(STATUS_WRONG_PARENT);
                }
                self.apply_file(&file, true);
                self.header.reversed_change_set_id = if token.id == self.header.parent_change_set_id {
                    None
                } else {
                    Some(token.id.clone())
                };
            }
        }
        Ok(())
    }

    fn next_txn_id(&mut self) -> u64 {
        self.last_txn_id += 1;
        self.last_txn_id
    }

    fn commit(&mut self, changes: Vec<RecordChange>, codes: Vec<Code>) {
        let mut ops = Vec::new();
        for change in &changes {
            for PropertyValue { class, name, value } in &change.values {
                let key = property_key(class, name);
                let before = self
                    .records
                    .get(&change.element_id)
                    .and_then(|r| r.get(&key))
                    .cloned();
                set_value(&mut self.records, &change.element_id, &key, Some(value.clone()));
                ops.push(RecordOp {
                    element_id: change.element_id.clone(),
                    key,
                    before,
                    after: Some(value.clone()),
                });
            }
        }
        let id = self.next_txn_id();
        self.local.push(LocalTxn {
            txn: PendingTxn::data(id, changes, codes),
            ops,
        });
    }

    fn import(&mut self, delta: &SchemaDelta) {
        self.apply_schema(delta, true);
        let id = self.next_txn_id();
        self.local.push(LocalTxn {
            txn: PendingTxn::schema_import(id, delta.clone()),
            ops: Vec::new(),
        });
    }

    fn local_schema(&self) -> Option<SchemaDelta> {
        self.local
            .iter()
            .filter_map(|t| t.txn.schema())
            .fold(None, |acc: Option<SchemaDelta>, delta| match acc {
                None => Some(delta.clone()),
                Some(mut combined) => {
                    combined.version = combined.version.max(delta.version);
                    combined.changes.extend(delta.changes.iter().cloned());
                    Some(combined)
                }
            })
    }
}

/// Knobs and counters shared by an engine and its handles.
#[derive(Debug, Default)]
pub struct EngineControls {
    /// Change-set id whose application fails with `STATUS_INJECTED`.
    pub fail_apply_of: Option<String>,
    /// Fail the next `reopen`.
    pub fail_next_reopen: bool,
    /// Fail the next `replay_txn`.
    pub fail_next_replay: bool,
    /// Single-token applies performed.
    pub sync_applies: usize,
    /// Batch applies performed.
    pub batch_applies: usize,
}

impl EngineControls {
    fn injected_failure(&self, id: &str) -> bool {
        self.fail_apply_of.as_deref() == Some(id)
    }
}

/// Native engine over JSON replica files.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    controls: Arc<Mutex<EngineControls>>,
}

impl SimulatedEngine {
    /// Creates an engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every application of `id` fail.
    pub fn fail_apply_of(&self, id: impl Into<String>) {
        self.controls.lock().fail_apply_of = Some(id.into());
    }

    /// Makes the next reopen fail.
    pub fn fail_next_reopen(&self) {
        self.controls.lock().fail_next_reopen = true;
    }

    /// Makes the next transaction replay fail.
    pub fn fail_next_replay(&self) {
        self.controls.lock().fail_next_replay = true;
    }

    /// Number of single-token applies so far.
    pub fn sync_applies(&self) -> usize {
        self.controls.lock().sync_applies
    }

    /// Number of batch applies so far.
    pub fn batch_applies(&self) -> usize {
        self.controls.lock().batch_applies
    }
}

impl NativeEngine for SimulatedEngine {
    type Replica = SimulatedReplica;

    fn open(&self, path: &Path, mode: OpenMode) -> NativeResult<SimulatedReplica> {
        let state = ReplicaState::load(path)?;
        Ok(SimulatedReplica {
            path: path.to_path_buf(),
            mode,
            state: Some(state),
            controls: Arc::clone(&self.controls),
        })
    }

    fn read_header(&self, path: &Path) -> NativeResult<ReplicaHeader> {
        Ok(ReplicaState::load(path)?.header)
    }

    fn apply_batch(&self, path: &Path, request: &ApplyRequest) -> ApplyResponse {
        self.controls.lock().batch_applies += 1;
        let mut state = match ReplicaState::load(path) {
            Ok(state) => state,
            Err(e) => return ApplyResponse::failure(STATUS_BAD_FILE, 0, e.to_string()),
        };

        let mut failure = None;
        for (applied, token) in request.tokens.iter().enumerate() {
            if self.controls.lock().injected_failure(&token.id) {
                failure = Some(ApplyResponse::failure(STATUS_INJECTED, applied, "injected failure"));
                break;
            }
            if let Err(status) = state.apply_token(token, request.option) {
                failure = Some(ApplyResponse::failure(
                    status,
                    applied,
                    format!("cannot {} {}", request.option, token.id),
                ));
                break;
            }
        }
        if let Err(e) = state.save(path) {
            return ApplyResponse::failure(STATUS_BAD_FILE, 0, e.to_string());
        }
        failure.unwrap_or_else(|| ApplyResponse::success(request.tokens.len()))
    }

    fn extract_codes(&self, file: &Path) -> NativeResult<Vec<Code>> {
        Ok(ChangeSetFile::read(file)?.codes)
    }

    fn read_schema_delta(&self, token: &ChangeSetToken) -> NativeResult<Option<SchemaDelta>> {
        Ok(ChangeSetFile::read(&token.pathname)?.schema)
    }
}

/// Open handle on a simulated replica file.
#[derive(Debug)]
pub struct SimulatedReplica {
    path: PathBuf,
    mode: OpenMode,
    state: Option<ReplicaState>,
    controls: Arc<Mutex<EngineControls>>,
}

impl SimulatedReplica {
    /// In-memory state; `None` while closed.
    pub fn state(&self) -> Option<&ReplicaState> {
        self.state.as_ref()
    }

    /// A stored value.
    pub fn value(&self, element: &str, class: &str, property: &str) -> Option<Value> {
        self.state
            .as_ref()
            .and_then(|s| s.value(element, class, property).cloned())
    }

    /// Records an uncommitted write.
    pub fn edit(&mut self, element: &str, class: &str, property: &str, value: Value) -> NativeResult<()> {
        self.mutate(|s| {
            s.unsaved.push(RecordChange {
                element_id: element.to_string(),
                class: class.to_string(),
                values: vec![PropertyValue {
                    class: class.to_string(),
                    name: property.to_string(),
                    value,
                }],
            });
            Ok(())
        })
    }

    /// Uses a code in the uncommitted edits.
    pub fn use_code(&mut self, code: Code) -> NativeResult<()> {
        self.mutate(|s| {
            s.unsaved_codes.push(code);
            Ok(())
        })
    }

    /// Commits the uncommitted edits as one pending transaction.
    pub fn save_changes(&mut self) -> NativeResult<()> {
        self.mutate(|s| {
            let changes = std::mem::take(&mut s.unsaved);
            let codes = std::mem::take(&mut s.unsaved_codes);
            s.commit(changes, codes);
            Ok(())
        })
    }

    /// Drops the uncommitted edits.
    pub fn abandon_changes(&mut self) -> NativeResult<()> {
        self.mutate(|s| {
            s.unsaved.clear();
            s.unsaved_codes.clear();
            Ok(())
        })
    }

    fn open_state(&self) -> NativeResult<&ReplicaState> {
        self.state
            .as_ref()
            .ok_or_else(|| NativeError::new(codes::CLOSED, "replica is closed"))
    }

    fn mutate<T>(&mut self, f: impl FnOnce(&mut ReplicaState) -> NativeResult<T>) -> NativeResult<T> {
        if self.mode == OpenMode::ReadOnly {
            return Err(NativeError::new(codes::READ_ONLY, "replica is read-only"));
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| NativeError::new(codes::CLOSED, "replica is closed"))?;
        let out = f(state)?;
        state.save(&self.path)?;
        Ok(out)
    }
}

impl NativeReplica for SimulatedReplica {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn open_mode(&self) -> OpenMode {
        self.mode
    }

    fn header(&self) -> NativeResult<ReplicaHeader> {
        Ok(self.open_state()?.header.clone())
    }

    fn close(&mut self) {
        self.state = None;
    }

    fn reopen(&mut self, mode: OpenMode) -> NativeResult<()> {
        {
            let mut controls = self.controls.lock();
            if controls.fail_next_reopen {
                controls.fail_next_reopen = false;
                return Err(NativeError::new(codes::REOPEN, "reopen refused"));
            }
        }
        self.state = Some(ReplicaState::load(&self.path)?);
        self.mode = mode;
        Ok(())
    }

    fn apply_change_set(&mut self, token: &ChangeSetToken, option: ApplyOption) -> ApplyStatus {
        {
            let mut controls = self.controls.lock();
            controls.sync_applies += 1;
            if controls.injected_failure(&token.id) {
                return STATUS_INJECTED;
            }
        }
        if self.mode == OpenMode::ReadOnly {
            return STATUS_NOT_WRITABLE;
        }
        let Some(state) = self.state.as_mut() else {
            return STATUS_NOT_WRITABLE;
        };
        if let Err(status) = state.apply_token(token, option) {
            return status;
        }
        match state.save(&self.path) {
            Ok(()) => ApplyStatus::SUCCESS,
            Err(_) => STATUS_BAD_FILE,
        }
    }

    fn set_replica_id(&mut self, id: ReplicaId) -> NativeResult<()> {
        self.mutate(|s| {
            s.header.replica_id = id;
            Ok(())
        })
    }

    fn has_unsaved_changes(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| !s.unsaved.is_empty() || !s.unsaved_codes.is_empty())
    }

    fn has_pending_txns(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.local.is_empty())
    }

    fn start_create_change_set(&mut self) -> NativeResult<LocalChangeSet> {
        let path = self.path.clone();
        self.mutate(|s| {
            if s.local.is_empty() {
                return Err(NativeError::new(codes::NOTHING_PENDING, "no pending transactions"));
            }
            let file = ChangeSetFile::new(
                s.header.parent_change_set_id.clone(),
                s.local.iter().flat_map(|t| t.ops.iter().cloned()).collect(),
                s.local_schema(),
                s.local.iter().flat_map(|t| t.txn.codes.iter().cloned()).collect(),
            );
            let pathname = path.with_file_name(format!("{}.cs", file.id));
            let bytes = file.to_bytes();
            fs::write(&pathname, &bytes).map_err(|e| io_error(&pathname, e))?;
            s.creating = Some(file.id.clone());
            Ok(LocalChangeSet {
                id: file.id,
                parent_id: file.parent_id,
                pathname,
                file_size: bytes.len() as u64,
                contains_schema: file.schema.is_some(),
            })
        })
    }

    fn finish_create_change_set(&mut self, change_set: &ChangeSet) -> NativeResult<()> {
        self.mutate(|s| {
            s.header.parent_change_set_id = change_set.id.clone();
            s.header.reversed_change_set_id = None;
            s.local.clear();
            s.creating = None;
            Ok(())
        })
    }

    fn abandon_create_change_set(&mut self) {
        let path = self.path.clone();
        let creating = self.state.as_mut().and_then(|s| s.creating.take());
        if let Some(id) = creating {
            let file = path.with_file_name(format!("{id}.cs"));
            if let Err(e) = fs::remove_file(&file) {
                warn!(path = %file.display(), error = %e, "failed to remove abandoned change-set");
            }
            if let Some(state) = &self.state {
                if let Err(e) = state.save(&path) {
                    warn!(path = %path.display(), error = %e, "failed to save replica after abandon");
                }
            }
        }
    }

    fn pending_txns(&self) -> NativeResult<Vec<PendingTxn>> {
        Ok(self.open_state()?.local.iter().map(|t| t.txn.clone()).collect())
    }

    fn discard_pending_txns(&mut self) -> NativeResult<()> {
        self.mutate(|s| {
            s.undo_local();
            s.local.clear();
            Ok(())
        })
    }

    fn replay_txn(&mut self, txn: &PendingTxn) -> NativeResult<()> {
        {
            let mut controls = self.controls.lock();
            if controls.fail_next_replay {
                controls.fail_next_replay = false;
                return Err(NativeError::new(codes::REPLAY, "replay refused"));
            }
        }
        self.mutate(|s| {
            match &txn.payload {
                TxnPayload::Data(changes) => s.commit(changes.clone(), txn.codes.clone()),
                TxnPayload::Schema(delta) => s.import(delta),
            }
            Ok(())
        })
    }

    fn import_schema(&mut self, delta: &SchemaDelta) -> NativeResult<()> {
        self.mutate(|s| {
            if !s.unsaved.is_empty() {
                return Err(NativeError::new(codes::UNSAVED, "unsaved changes"));
            }
            s.import(delta);
            Ok(())
        })
    }

    fn schema_version(&self, schema: &str) -> Option<u32> {
        self.state
            .as_ref()
            .and_then(|s| s.schemas.get(schema))
            .map(|entry| entry.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use briefsync_protocol::{ChangeSetType, PropertyType};
    use serde_json::json;
    use tempfile::tempdir;

    fn token(file: &ChangeSetFile, dir: &Path, index: u64) -> ChangeSetToken {
        let path = dir.join(format!("{}.cs", file.id));
        fs::write(&path, file.to_bytes()).unwrap();
        ChangeSetToken {
            id: file.id.clone(),
            parent_id: file.parent_id.clone(),
            index,
            pathname: path,
            change_type: if file.schema.is_some() {
                ChangeSetType::Schema
            } else {
                ChangeSetType::Regular
            },
            push_date: None,
        }
    }

    #[test]
    fn merge_reverse_reinstate() {
        let dir = tempdir().unwrap();
        let repo = RepositoryId::new_v4();
        let first = ChangeSetFile::new("", vec![RecordOp::set("e1", "Pump", "flow", None, json!(1))], None, vec![]);
        let second = ChangeSetFile::new(
            first.id.clone(),
            vec![RecordOp::set("e1", "Pump", "flow", Some(json!(1)), json!(2))],
            None,
            vec![],
        );
        let t1 = token(&first, dir.path(), 1);
        let t2 = token(&second, dir.path(), 2);

        let mut state = ReplicaState::new(repo, ReplicaId::new(2));
        assert_eq!(state.apply_token(&t2, ApplyOption::Merge), Err(STATUS_WRONG_PARENT));
        state.apply_token(&t1, ApplyOption::Merge).unwrap();
        state.apply_token(&t2, ApplyOption::Merge).unwrap();
        assert_eq!(state.value("e1", "Pump", "flow"), Some(&json!(2)));

        state.apply_token(&t2, ApplyOption::Reverse).unwrap();
        assert_eq!(state.header.reversed_change_set_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(state.value("e1", "Pump", "flow"), Some(&json!(1)));

        state.apply_token(&t2, ApplyOption::Reinstate).unwrap();
        assert!(state.header.reversed_change_set_id.is_none());
        assert_eq!(state.value("e1", "Pump", "flow"), Some(&json!(2)));
    }

    #[test]
    fn incoming_move_leaves_plain_rebase_with_stale_key() {
        let dir = tempdir().unwrap();
        let repo = RepositoryId::new_v4();
        let mut state = ReplicaState::new(repo, ReplicaId::new(2));
        state.commit(
            vec![RecordChange {
                element_id: "e1".into(),
                class: "Pump".into(),
                values: vec![PropertyValue {
                    class: "Pump".into(),
                    name: "flow".into(),
                    value: json!(12),
                }],
            }],
            vec![],
        );

        let schema = SchemaDelta::new("Plant", 2).with_change(SchemaChange::MoveProperty {
            property: "flow".into(),
            from_class: "Pump".into(),
            to_class: "Equipment".into(),
        });
        let incoming = ChangeSetFile::new("", vec![], Some(schema), vec![]);
        state
            .apply_token(&token(&incoming, dir.path(), 1), ApplyOption::Merge)
            .unwrap();

        assert_eq!(state.value("e1", "Pump", "flow"), Some(&json!(12)));
        assert_eq!(state.schemas["Plant"].version, 2);
    }

    #[test]
    fn retype_converts_stored_values() {
        let mut state = ReplicaState::new(RepositoryId::new_v4(), ReplicaId::STANDALONE);
        set_value(&mut state.records, "e1", "Pump.rpm", Some(json!("1500")));
        let delta = SchemaDelta::new("Plant", 3).with_change(SchemaChange::RetypeProperty {
            class: "Pump".into(),
            property: "rpm".into(),
            from: PropertyType::String,
            to: PropertyType::Integer,
        });
        state.apply_schema(&delta, true);
        assert_eq!(state.value("e1", "Pump", "rpm"), Some(&json!(1500)));
        state.apply_schema(&delta, false);
        assert_eq!(state.value("e1", "Pump", "rpm"), Some(&json!("1500")));
    }

    #[test]
    fn handle_writes_through_and_creates_change_sets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2.bim");
        ReplicaState::new(RepositoryId::new_v4(), ReplicaId::new(2))
            .save(&path)
            .unwrap();

        let engine = SimulatedEngine::new();
        let mut handle = engine.open(&path, OpenMode::ReadWrite).unwrap();
        handle.edit("e1", "Pump", "flow", json!(5)).unwrap();
        handle.use_code(Code::new("tag", "site", "P-1")).unwrap();
        assert!(handle.has_unsaved_changes());
        handle.save_changes().unwrap();
        assert!(handle.has_pending_txns());

        let local = handle.start_create_change_set().unwrap();
        assert!(!local.contains_schema);
        assert_eq!(
            engine.extract_codes(&local.pathname).unwrap(),
            vec![Code::new("tag", "site", "P-1")]
        );

        handle.close();
        handle.reopen(OpenMode::ReadOnly).unwrap();
        assert_eq!(handle.value("e1", "Pump", "flow"), Some(json!(5)));
        assert!(handle.edit("e1", "Pump", "flow", json!(6)).is_err());
    }

    #[test]
    fn replayed_transactions_keep_their_codes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3.bim");
        ReplicaState::new(RepositoryId::new_v4(), ReplicaId::new(3))
            .save(&path)
            .unwrap();
        let engine = SimulatedEngine::new();
        let mut handle = engine.open(&path, OpenMode::ReadWrite).unwrap();
        handle.edit("e1", "Pump", "flow", json!(5)).unwrap();
        handle.use_code(Code::new("tag", "site", "P-2")).unwrap();
        handle.save_changes().unwrap();

        let txns = handle.pending_txns().unwrap();
        assert_eq!(txns[0].codes, vec![Code::new("tag", "site", "P-2")]);
        handle.discard_pending_txns().unwrap();
        assert_eq!(handle.value("e1", "Pump", "flow"), None);
        handle.replay_txn(&txns[0]).unwrap();

        let local = handle.start_create_change_set().unwrap();
        assert_eq!(
            engine.extract_codes(&local.pathname).unwrap(),
            vec![Code::new("tag", "site", "P-2")]
        );
    }

    #[test]
    fn corrupt_files_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("9.bim");
        fs::write(&path, b"garbage").unwrap();
        let err = SimulatedEngine::new().read_header(&path).unwrap_err();
        assert_eq!(err.code, codes::CORRUPT);
    }
}
