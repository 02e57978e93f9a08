//! Execution of a pre-processed transaction over the graph.
//!
//! Every value of the transaction is applied in order. Applying a value may
//! recurse into its derived values and into values that depend on it, so one
//! transaction can produce many operations. Descriptor failures never abort
//! the walk; they are recorded into the failed node and the walk goes on with
//! independent branches.

use std::collections::BTreeSet;

use super::record::RecordedTxnOp;
use super::refresh::Refresher;
use super::status::{equal_details, value_details};
use super::txn::{KvForTxn, QueuedTxn, ResyncType, TxnType};
use crate::descriptor::{DescriptorRef, Registry};
use crate::graph::{GraphWriter, LastUpdate, NodeError};
use crate::kv::{
    DescriptorError, KeyValuePair, TxnOperation, ValueOrigin, ValueRef, ValueState,
};

type ApplyResult = Result<(), DescriptorError>;

#[derive(Debug, Clone)]
struct ApplyArgs {
    kv: KvForTxn,
    base_key: String,
    is_derived: bool,
    is_dep_update: bool,
}

impl ApplyArgs {
    fn base(kv: KvForTxn) -> Self {
        Self {
            base_key: kv.key.clone(),
            kv,
            is_derived: false,
            is_dep_update: false,
        }
    }
}

pub(crate) struct Executor<'a, 'g> {
    registry: &'a Registry,
    graph: &'a mut GraphWriter<'g>,
    txn: &'a QueuedTxn,
    /// Base keys whose status changed.
    updated: &'a mut BTreeSet<String>,
    dry_run: bool,
    log_graph_walk: bool,
    /// Base values applied (or being applied) by this transaction.
    applied: BTreeSet<String>,
    /// Keys on the current recursion path, used to cut dependency cycles.
    branch: BTreeSet<String>,
    /// Keys being re-created by the current update.
    recreating: Option<BTreeSet<String>>,
    depth: usize,
}

impl<'a, 'g> Executor<'a, 'g> {
    pub fn new(
        registry: &'a Registry,
        graph: &'a mut GraphWriter<'g>,
        txn: &'a QueuedTxn,
        updated: &'a mut BTreeSet<String>,
        dry_run: bool,
        log_graph_walk: bool,
    ) -> Self {
        Self {
            registry,
            graph,
            txn,
            updated,
            dry_run,
            log_graph_walk,
            applied: BTreeSet::new(),
            branch: BTreeSet::new(),
            recreating: None,
            depth: 0,
        }
    }

    /// Applies all values of the transaction and returns the executed
    /// operations. With dry-run no descriptor callback is invoked.
    pub fn execute(mut self) -> Vec<RecordedTxnOp> {
        let txn = self.txn;
        let what = if self.dry_run {
            "simulate transaction"
        } else {
            "execute transaction"
        };
        if self.log_graph_walk {
            log::debug!("[BEGIN] {} (seq_num={})", what, txn.seq_num);
        }

        let mut executed = Vec::new();
        // Most recently applied first, so that reverts go backwards.
        let mut prev_values: Vec<(String, Option<ValueRef>)> = Vec::new();
        let mut revert = false;

        for kv in &txn.values {
            self.applied.insert(kv.key.clone());
            let args = ApplyArgs::base(kv.clone());
            let (prev_value, result) = self.apply_value(&args, &mut executed);
            prev_values.insert(0, (kv.key.clone(), prev_value));
            if result.is_err() && txn.revert_on_failure() {
                let failed = BTreeSet::from([kv.key.clone()]);
                Refresher::new(self.registry, &mut *self.graph, &mut *self.updated, self.log_graph_walk)
                    .refresh(Some(&failed), None, true);
                revert = true;
                break;
            }
        }

        if revert {
            // Record the state between the failure and the revert.
            if !self.dry_run {
                self.graph.commit();
            }
            for (key, value) in prev_values {
                let kv = KvForTxn {
                    key,
                    value,
                    metadata: None,
                    origin: ValueOrigin::FromNb,
                    is_revert: true,
                };
                let _ = self.apply_value(&ApplyArgs::base(kv), &mut executed);
            }
        }

        if self.log_graph_walk {
            log::debug!("[END] {} (seq_num={})", what, txn.seq_num);
        }
        compress_ops(executed)
    }

    fn visit<T>(&mut self, operation: &str, key: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        if !self.log_graph_walk {
            return f(self);
        }
        self.depth += 1;
        let indent = " ".repeat(self.depth * 2);
        log::debug!("{}[BEGIN] {} (key = {})", indent, operation, key);
        let result = f(self);
        log::debug!("{}[END] {} (key = {})", indent, operation, key);
        self.depth -= 1;
        result
    }

    /// Applies one value received from NB or SB (or re-applied as part of a
    /// dependency update). Returns the previous value, for reverts.
    fn apply_value(
        &mut self,
        args: &ApplyArgs,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> (Option<ValueRef>, ApplyResult) {
        let key = args.kv.key.clone();
        let prev_value = self.graph.node(&key).and_then(|n| n.value().cloned());
        if self.branch.contains(&key) {
            return (prev_value, Ok(()));
        }
        self.branch.insert(key.clone());
        let result = self.visit("apply_value", &key, |this| this.apply_value_step(args, executed));
        self.branch.remove(&key);
        (prev_value, result)
    }

    fn apply_value_step(&mut self, args: &ApplyArgs, executed: &mut Vec<RecordedTxnOp>) -> ApplyResult {
        let key = args.kv.key.as_str();
        self.graph.set_node(key);
        let Some(node) = self.graph.node(key) else {
            return Ok(());
        };

        let prev_state = node.state();
        let prev_op = node.last_operation();
        let prev_err = node.error_string();
        let prev_details = value_details(&**self.graph, node);
        let prev_update = node.last_update().cloned();
        let has_value = node.value().is_some();
        let available = node.is_available();

        let mut op = self.pre_record_op(args);
        op.operation = if args.is_dep_update {
            let operation = self.dep_update_operation(key);
            if operation == TxnOperation::Undefined {
                if !has_value {
                    // Deleted within the same round of dependency updates.
                    self.graph.delete_node(key);
                }
                return Ok(());
            }
            operation
        } else if args.kv.value.is_none() {
            TxnOperation::Delete
        } else if !has_value || !available {
            TxnOperation::Create
        } else {
            TxnOperation::Update
        };

        let retry = if let Some(nb) = &self.txn.nb {
            nb.retry
        } else if let Some(update) = &prev_update {
            update.retry
        } else if args.is_derived {
            self.graph
                .node(&args.base_key)
                .and_then(|n| n.last_update())
                .and_then(|u| u.retry)
        } else {
            None
        };
        self.graph.set_node(key).last_update = Some(LastUpdate {
            txn_seq: self.txn.seq_num,
            operation: op.operation,
            value: args.kv.value.clone(),
            revert: args.kv.is_revert,
            retry,
        });

        // A value already broken by this transaction is left for the refresh
        // in post-processing, unless it is being reverted.
        let broken_in_txn = prev_update
            .as_ref()
            .is_some_and(|u| u.txn_seq == self.txn.seq_num);
        if prev_state.is_failure() && !args.kv.is_revert && broken_in_txn {
            return match self.graph.node(key).and_then(|n| n.error()) {
                Some(err) => Err(err.error.clone()),
                None => Ok(()),
            };
        }

        if op.operation == TxnOperation::Create
            && prev_state == ValueState::Missing
            && self.unconfirmed_missing(args)
        {
            return Ok(());
        }

        let result = match op.operation {
            TxnOperation::Delete => self.apply_delete(args, op, executed, args.is_dep_update, false),
            TxnOperation::Create => self.apply_create(args, op, executed),
            TxnOperation::Update => self.apply_update(args, op, executed),
            _ => Ok(()),
        };

        if !self.dry_run {
            let node = self.graph.node(key);
            let changed = prev_update.is_none()
                || prev_state != node.map_or(ValueState::Nonexistent, |n| n.state())
                || prev_op != node.map_or(TxnOperation::Undefined, |n| n.last_operation())
                || prev_err != node.and_then(|n| n.error_string())
                || !equal_details(
                    &prev_details,
                    &node.map(|n| value_details(&**self.graph, n)).unwrap_or_default(),
                );
            if changed {
                self.updated.insert(args.base_key.clone());
            }
        }
        result
    }

    /// Removes a value. With `pending` the value is only taken down because
    /// its dependencies are no longer satisfied and it returns to PENDING.
    fn apply_delete(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
        pending: bool,
        recreate: bool,
    ) -> ApplyResult {
        let key = args.kv.key.clone();
        self.visit("apply_delete", &key, |this| {
            let Some(node) = this.graph.node(&key) else {
                return Ok(());
            };
            if node.value().is_none() {
                // Removing a value that does not exist is a no-op.
                this.graph.delete_node(&key);
                return Ok(());
            }
            let prev_state = node.state();
            let outcome = if node.is_available() {
                this.delete_available(args, executed, pending)
            } else {
                op.noop = true;
                DeleteOutcome::Done
            };

            match outcome {
                DeleteOutcome::Inherited(err) => {
                    // A derived or dependent value failed instead.
                    this.graph.set_node(&key).unavailable = false;
                    this.update_state(&key, prev_state);
                    Err(err)
                }
                DeleteOutcome::Done => {
                    this.graph.set_node(&key).error = None;
                    if pending {
                        op.new_state = ValueState::Pending;
                        this.update_state(&key, ValueState::Pending);
                    } else {
                        op.new_state = ValueState::Removed;
                        if args.is_derived && !recreate {
                            this.graph.delete_node(&key);
                        } else {
                            this.update_state(&key, ValueState::Removed);
                        }
                    }
                    executed.push(op);
                    Ok(())
                }
                DeleteOutcome::Failed { err, retriable } => {
                    op.new_err = Some(err.clone());
                    op.new_state = this.mark_failed(args, err.clone(), retriable);
                    executed.push(op);
                    this.own_error(args, err)
                }
            }
        })
    }

    fn delete_available(
        &mut self,
        args: &ApplyArgs,
        executed: &mut Vec<RecordedTxnOp>,
        pending: bool,
    ) -> DeleteOutcome {
        let key = args.kv.key.as_str();
        // Unavailable from now on, so that nothing treats it as a satisfied
        // dependency during the removal.
        self.graph.set_node(key).unavailable = true;
        if !pending {
            self.update_state(key, ValueState::Removed);
        }

        if !args.is_derived {
            let derived: Vec<KvForTxn> = self
                .graph
                .derived_nodes(key)
                .into_iter()
                .map(|n| KvForTxn {
                    key: n.key().to_string(),
                    value: None,
                    metadata: None,
                    origin: args.kv.origin,
                    is_revert: args.kv.is_revert,
                })
                .collect();
            if let Err(err) = self.apply_derived(derived, args, false, executed) {
                return DeleteOutcome::Inherited(err);
            }
        }

        if let Err(err) = self.run_dep_updates(key, args, false, executed) {
            return DeleteOutcome::Inherited(err);
        }

        let descriptor = self.registry.descriptor_for_key(key);
        if let (false, Some(descriptor)) = (self.dry_run, descriptor) {
            let Some(node) = self.graph.node(key) else {
                return DeleteOutcome::Done;
            };
            let is_derived = node.is_derived();
            if args.kv.origin != ValueOrigin::FromSb {
                if let Some(value) = node.value().cloned() {
                    let metadata = node.metadata().cloned();
                    if let Err(err) = descriptor.delete(key, value.as_ref(), metadata.as_ref()) {
                        let retriable = descriptor.is_retriable_failure(&err);
                        return DeleteOutcome::Failed { err, retriable };
                    }
                }
            }
            if !is_derived && descriptor.with_metadata() {
                self.graph.set_node(key).metadata = None;
            }
        }
        DeleteOutcome::Done
    }

    /// Creates a value that did not exist or was unavailable.
    fn apply_create(
        &mut self,
        args: &ApplyArgs,
        op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.clone();
        self.visit("apply_create", &key, |this| this.create_step(args, op, executed))
    }

    fn create_step(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        let Some(value) = args.kv.value.clone() else {
            return Ok(());
        };
        self.graph.set_node(key).value = Some(value.clone());

        let descriptor = self.registry.descriptor_for_key(key);
        if let Some(descriptor) = &descriptor {
            let label = descriptor.key_label(key);
            let node = self.graph.set_node(key);
            node.descriptor = Some(descriptor.name().to_string());
            node.label = label;
        }

        let unimplemented =
            args.kv.origin == ValueOrigin::FromNb && !args.is_derived && descriptor.is_none();
        if unimplemented {
            if self.node_state(key) == ValueState::Unimplemented {
                return Ok(());
            }
            let node = self.graph.set_node(key);
            node.unavailable = true;
            node.error = None;
            op.noop = true;
            op.new_state = ValueState::Unimplemented;
            self.update_state(key, ValueState::Unimplemented);
            executed.push(op);
            return Ok(());
        }

        if args.is_derived {
            self.graph.set_node(key).derived_from = Some(args.base_key.clone());
        }

        if !self.dry_run && args.kv.origin == ValueOrigin::FromNb {
            if let Some(descriptor) = &descriptor {
                if let Err(err) = descriptor.validate(key, value.as_ref()) {
                    return self.mark_invalid(args, op, err, executed);
                }
            }
        }

        let derives = self.apply_new_relations(args, descriptor.as_ref(), None, true, executed)?;

        if !self.graph.is_ready(key) {
            let node = self.graph.set_node(key);
            node.unavailable = true;
            node.error = None;
            op.new_state = ValueState::Pending;
            op.noop = true;
            self.update_state(key, ValueState::Pending);
            executed.push(op);
            return Ok(());
        }

        if let (false, Some(descriptor)) = (self.dry_run, &descriptor) {
            let metadata = if args.kv.origin != ValueOrigin::FromSb {
                match descriptor.create(key, value.as_ref()) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        self.graph.set_node(key).unavailable = true;
                        let retriable = descriptor.is_retriable_failure(&err);
                        op.new_err = Some(err.clone());
                        op.new_state = self.mark_failed(args, err.clone(), retriable);
                        executed.push(op);
                        return self.own_error(args, err);
                    }
                }
            } else {
                // Already present in SB.
                args.kv.metadata.clone()
            };
            if !args.is_derived && descriptor.with_metadata() {
                self.graph.set_node(key).metadata = metadata;
            }
        }

        let node = self.graph.set_node(key);
        node.error = None;
        node.unavailable = false;
        op.new_state = applied_state(args.kv.origin);
        self.update_state(key, op.new_state);
        executed.push(op);

        self.run_dep_updates(key, args, true, executed)?;

        if args.is_derived {
            return Ok(());
        }
        let derived = derived_for_txn(derives, args);
        self.apply_derived(derived, args, true, executed)
    }

    /// Applies a new value to an existing available value.
    fn apply_update(
        &mut self,
        args: &ApplyArgs,
        op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.clone();
        self.visit("apply_update", &key, |this| this.update_step(args, op, executed))
    }

    fn update_step(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        let Some(new_value) = args.kv.value.clone() else {
            return Ok(());
        };
        let descriptor = self.registry.descriptor_for_key(key);

        if !self.dry_run && args.kv.origin == ValueOrigin::FromNb {
            if let Some(descriptor) = &descriptor {
                if let Err(err) = descriptor.validate(key, new_value.as_ref()) {
                    self.graph.set_node(key).value = Some(new_value);
                    return self.mark_invalid(args, op, err, executed);
                }
            }
        }

        let Some(node) = self.graph.node(key) else {
            return Ok(());
        };
        let Some(old_value) = node.value().cloned() else {
            return Ok(());
        };
        let metadata = node.metadata().cloned();

        let equivalent = match &descriptor {
            Some(d) => d.equivalent(key, old_value.as_ref(), new_value.as_ref()),
            None => old_value.equals(new_value.as_ref()),
        };
        let recreate = !equivalent
            && args.kv.origin != ValueOrigin::FromSb
            && descriptor.as_ref().is_some_and(|d| {
                !d.supports_update()
                    || d.update_with_recreate(
                        key,
                        old_value.as_ref(),
                        new_value.as_ref(),
                        metadata.as_ref(),
                    )
            });

        if recreate {
            let mut recreating: BTreeSet<String> = self
                .graph
                .derived_nodes(key)
                .into_iter()
                .map(|n| n.key().to_string())
                .collect();
            recreating.insert(key.to_string());
            let saved = self.recreating.replace(recreating);
            let result = self.recreate(args, executed);
            self.recreating = saved;
            return result;
        }

        self.graph.set_node(key).value = Some(new_value.clone());

        let derives = match self.apply_new_relations(
            args,
            descriptor.as_ref(),
            Some(&old_value),
            !equivalent,
            executed,
        ) {
            Ok(derives) => derives,
            Err(err) => {
                self.graph.set_node(key).value = Some(old_value);
                return Err(err);
            }
        };

        // New dependencies not satisfied: take the old value down and wait
        // with the new one.
        if !equivalent && !self.graph.is_ready(key) {
            self.graph.set_node(key).value = Some(old_value);
            let result = self.apply_delete(args, op, executed, true, false);
            self.graph.set_node(key).value = Some(new_value);
            return result;
        }

        if let (false, false, Some(descriptor)) = (self.dry_run, equivalent, &descriptor) {
            let new_metadata = if args.kv.origin != ValueOrigin::FromSb {
                match descriptor.update(key, old_value.as_ref(), new_value.as_ref(), metadata.as_ref()) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        let retriable = descriptor.is_retriable_failure(&err);
                        op.new_err = Some(err.clone());
                        op.new_state = self.mark_failed(args, err.clone(), retriable);
                        executed.push(op);
                        return self.own_error(args, err);
                    }
                }
            } else {
                args.kv.metadata.clone()
            };
            if !args.is_derived && descriptor.with_metadata() {
                self.graph.set_node(key).metadata = new_metadata;
            }
        }

        let node = self.graph.set_node(key);
        node.error = None;
        node.unavailable = false;
        // A value found in SB already in sync stays discovered.
        op.new_state = if equivalent && op.prev_state == ValueState::Discovered {
            ValueState::Discovered
        } else {
            applied_state(args.kv.origin)
        };
        self.update_state(key, op.new_state);

        if !equivalent || op.prev_state != op.new_state {
            op.noop = equivalent;
            executed.push(op);
        }

        if args.is_derived {
            return Ok(());
        }
        let derived = derived_for_txn(derives, args);
        self.apply_derived(derived, args, true, executed)
    }

    fn recreate(&mut self, args: &ApplyArgs, executed: &mut Vec<RecordedTxnOp>) -> ApplyResult {
        let key = args.kv.key.as_str();

        let mut delete_op = self.pre_record_op(args);
        delete_op.operation = TxnOperation::Delete;
        delete_op.new_value = None;
        self.apply_delete(args, delete_op, executed, false, true)?;
        if self.node_state(key).is_failure() {
            // The obsolete revision is still there.
            return Ok(());
        }

        self.graph.set_node(key);
        let mut create_op = self.pre_record_op(args);
        create_op.operation = TxnOperation::Create;
        create_op.prev_value = None;
        self.apply_create(args, create_op, executed)
    }

    /// Sets dependencies and derived keys for the current value of the node
    /// and removes derived values that are no longer derived. Returns the
    /// new derived values.
    fn apply_new_relations(
        &mut self,
        args: &ApplyArgs,
        descriptor: Option<&DescriptorRef>,
        prev_value: Option<&ValueRef>,
        update_deps: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> Result<Vec<KeyValuePair>, DescriptorError> {
        if args.is_derived && !update_deps {
            return Ok(Vec::new());
        }
        let key = args.kv.key.as_str();
        let Some(value) = self.graph.node(key).and_then(|n| n.value().cloned()) else {
            return Ok(Vec::new());
        };

        let mut prev_derived = BTreeSet::new();
        let mut derived_values = Vec::new();
        if !args.is_derived {
            if let Some(descriptor) = descriptor {
                if let Some(prev_value) = prev_value {
                    prev_derived = descriptor
                        .derived_values(key, prev_value.as_ref())
                        .into_iter()
                        .map(|kv| kv.key)
                        .collect();
                }
                derived_values = descriptor.derived_values(key, value.as_ref());
            }
        }
        let new_derived: BTreeSet<String> = derived_values.iter().map(|kv| kv.key.clone()).collect();

        let update_derived = prev_derived != new_derived;
        if update_deps || update_derived {
            let dependencies = descriptor
                .map(|d| d.dependencies(key, value.as_ref()))
                .unwrap_or_default();
            self.graph.set_targets(key, dependencies, new_derived.clone());
        }

        if update_derived {
            let obsolete: Vec<KvForTxn> = prev_derived
                .difference(&new_derived)
                .map(|derived| KvForTxn {
                    key: derived.clone(),
                    value: None,
                    metadata: None,
                    origin: args.kv.origin,
                    is_revert: args.kv.is_revert,
                })
                .collect();
            if !obsolete.is_empty() {
                self.apply_derived(obsolete, args, false, executed)?;
            }
        }
        Ok(derived_values)
    }

    /// (Re-)applies derived values, sorted by key.
    fn apply_derived(
        &mut self,
        mut derived: Vec<KvForTxn>,
        args: &ApplyArgs,
        check: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.clone();
        self.visit("apply_derived", &key, |this| {
            derived.sort_by(|a, b| a.key.cmp(&b.key));
            let mut result = Ok(());
            for kv in derived {
                if check && !this.valid_derived_kv(&kv) {
                    continue;
                }
                let derived_args = ApplyArgs {
                    kv,
                    base_key: args.base_key.clone(),
                    is_derived: true,
                    is_dep_update: false,
                };
                if let (_, Err(err)) = this.apply_value(&derived_args, executed) {
                    result = Err(err);
                }
            }
            result
        })
    }

    /// Re-evaluates NB values that depend on `key`. After a create only
    /// unavailable dependents are considered, after a delete only available
    /// ones.
    fn run_dep_updates(
        &mut self,
        key: &str,
        args: &ApplyArgs,
        for_unavailable: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        self.visit("run_dep_updates", key, |this| {
            let mut result = Ok(());
            for dependent in this.graph.dependents(key) {
                let Some(node) = this.graph.node(&dependent) else {
                    continue;
                };
                if node.origin() != ValueOrigin::FromNb {
                    continue;
                }
                if node.is_available() == for_unavailable {
                    continue;
                }
                let value = match node.last_update() {
                    Some(update) => update.value.clone(),
                    // Discovered values were never updated.
                    None => node.value().cloned(),
                };
                let dep_args = ApplyArgs {
                    kv: KvForTxn {
                        key: dependent.clone(),
                        value,
                        metadata: None,
                        origin: node.origin(),
                        is_revert: args.kv.is_revert,
                    },
                    base_key: node.base_key().to_string(),
                    is_derived: node.is_derived(),
                    is_dep_update: true,
                };
                if let (_, Err(err)) = this.apply_value(&dep_args, executed) {
                    result = Err(err);
                }
            }
            result
        })
    }

    fn dep_update_operation(&self, key: &str) -> TxnOperation {
        let available = self.graph.is_available(key);
        let ready = self.graph.is_ready(key);
        match (available, ready) {
            (false, true) => TxnOperation::Create,
            (true, false) => TxnOperation::Delete,
            _ => TxnOperation::Undefined,
        }
    }

    fn valid_derived_kv(&self, kv: &KvForTxn) -> bool {
        if kv.value.is_none() {
            log::warn!(
                "Derived nil value (txn {}, key '{}')",
                self.txn.seq_num,
                kv.key
            );
            return false;
        }
        if let Some(node) = self.graph.node(&kv.key) {
            if !node.is_derived() {
                log::warn!(
                    "Skipping derived value colliding with a base value (txn {}, key '{}')",
                    self.txn.seq_num,
                    kv.key
                );
                return false;
            }
        }
        true
    }

    /// A resync cannot tell whether a value of a descriptor without
    /// retrieve is really gone, so an unchanged MISSING value is left alone.
    fn unconfirmed_missing(&self, args: &ApplyArgs) -> bool {
        if self.txn.resync_type() == ResyncType::NotResync {
            return false;
        }
        let key = args.kv.key.as_str();
        let Some(descriptor) = self.registry.descriptor_for_key(key) else {
            return false;
        };
        if descriptor.supports_retrieve() {
            return false;
        }
        let current = self.graph.node(key).and_then(|n| n.value());
        match (current, &args.kv.value) {
            (Some(old), Some(new)) => descriptor.equivalent(key, old.as_ref(), new.as_ref()),
            _ => false,
        }
    }

    fn mark_invalid(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        err: DescriptorError,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> ApplyResult {
        let key = args.kv.key.as_str();
        self.graph.set_node(key).unavailable = true;
        op.new_err = Some(err.clone());
        op.new_state = ValueState::Invalid;
        op.noop = true;
        self.update_state(key, ValueState::Invalid);
        self.graph.set_node(key).error = Some(NodeError {
            error: err.clone(),
            retriable: false,
        });
        executed.push(op);
        self.own_error(args, err)
    }

    /// Decides between FAILED and RETRYING and stores the error.
    fn mark_failed(&mut self, args: &ApplyArgs, err: DescriptorError, retriable: bool) -> ValueState {
        let key = args.kv.key.as_str();
        let mut new_state = ValueState::Failed;
        let to_be_reverted = self.txn.revert_on_failure() && !args.kv.is_revert;
        if retriable && !to_be_reverted {
            let already_retried = self.txn.txn_type == TxnType::RetryFailedOps
                && self
                    .txn
                    .retry
                    .as_ref()
                    .is_some_and(|r| r.keys.contains_key(&args.base_key));
            let attempt = match (&self.txn.retry, already_retried) {
                (Some(retry), true) => retry.attempt + 1,
                _ => 1,
            };
            let policy = self
                .graph
                .node(key)
                .and_then(|n| n.last_update())
                .and_then(|u| u.retry);
            if policy.is_some_and(|p| p.allows(attempt)) {
                new_state = ValueState::Retrying;
            }
        }
        self.update_state(key, new_state);
        self.graph.set_node(key).error = Some(NodeError {
            error: err,
            retriable,
        });
        new_state
    }

    /// Failures of values not applied by this transaction are not reported
    /// as its errors.
    fn own_error(&self, args: &ApplyArgs, err: DescriptorError) -> ApplyResult {
        if self.applied.contains(&args.base_key) {
            Err(err)
        } else {
            Ok(())
        }
    }

    fn node_state(&self, key: &str) -> ValueState {
        self.graph
            .node(key)
            .map_or(ValueState::Nonexistent, |n| n.state())
    }

    fn update_state(&mut self, key: &str, state: ValueState) {
        let current = self.node_state(key);
        if current == state {
            return;
        }
        if self.log_graph_walk {
            log::debug!(
                "{}-> change value state from {} to {}",
                " ".repeat((self.depth + 1) * 2),
                current,
                state
            );
        }
        self.graph.set_node(key).state = state;
    }

    /// Fills the attributes known before the operation runs.
    fn pre_record_op(&self, args: &ApplyArgs) -> RecordedTxnOp {
        let key = args.kv.key.as_str();
        let node = self.graph.node(key);
        let prev_state = node.map_or(ValueState::Nonexistent, |n| n.state());
        let prev_value = if prev_state == ValueState::Removed {
            None
        } else {
            node.and_then(|n| n.value().cloned())
        };
        RecordedTxnOp {
            operation: TxnOperation::Undefined,
            key: key.to_string(),
            prev_value,
            new_value: args.kv.value.clone(),
            prev_state,
            new_state: prev_state,
            prev_err: node.and_then(|n| n.error()).map(|e| e.error.clone()),
            new_err: None,
            noop: false,
            is_derived: args.is_derived,
            is_property: args.is_derived && self.registry.descriptor_for_key(key).is_none(),
            is_revert: args.kv.is_revert,
            is_retry: self.txn.txn_type == TxnType::RetryFailedOps,
            is_recreate: self
                .recreating
                .as_ref()
                .is_some_and(|keys| keys.contains(key)),
        }
    }
}

enum DeleteOutcome {
    Done,
    /// A derived or dependent value failed.
    Inherited(DescriptorError),
    Failed {
        err: DescriptorError,
        retriable: bool,
    },
}

fn applied_state(origin: ValueOrigin) -> ValueState {
    if origin == ValueOrigin::FromSb {
        ValueState::Obtained
    } else {
        ValueState::Configured
    }
}

fn derived_for_txn(derives: Vec<KeyValuePair>, args: &ApplyArgs) -> Vec<KvForTxn> {
    derives
        .into_iter()
        .map(|kv| KvForTxn {
            key: kv.key,
            value: Some(kv.value),
            metadata: None,
            origin: args.kv.origin,
            is_revert: args.kv.is_revert,
        })
        .collect()
}

/// Merges intermediate operations: a Create that left the value PENDING
/// followed by another Create of the same key, and a Delete of a PENDING
/// value preceded by another Delete of the same key.
pub(crate) fn compress_ops(mut executed: Vec<RecordedTxnOp>) -> Vec<RecordedTxnOp> {
    let mut compressed: Vec<RecordedTxnOp> = Vec::with_capacity(executed.len());
    for i in 0..executed.len() {
        let op = &executed[i];
        let mut merged = false;
        if op.operation == TxnOperation::Create && op.new_state == ValueState::Pending {
            if let Some(j) = (i + 1..executed.len()).find(|&j| executed[j].key == op.key) {
                if executed[j].operation == TxnOperation::Create {
                    let (prev_value, prev_err, prev_state) =
                        (op.prev_value.clone(), op.prev_err.clone(), op.prev_state);
                    let later = &mut executed[j];
                    later.prev_value = prev_value;
                    later.prev_err = prev_err;
                    later.prev_state = prev_state;
                    merged = true;
                }
            }
        }
        if !merged {
            compressed.push(executed[i].clone());
        }
    }

    let mut i = compressed.len();
    while i > 0 {
        i -= 1;
        let op = &compressed[i];
        if op.operation != TxnOperation::Delete || op.prev_state != ValueState::Pending {
            continue;
        }
        let Some(j) = (0..i).rev().find(|&j| compressed[j].key == op.key) else {
            continue;
        };
        if compressed[j].operation != TxnOperation::Delete {
            continue;
        }
        let removed = compressed.remove(i);
        let earlier = &mut compressed[j];
        earlier.new_value = removed.new_value;
        earlier.new_err = removed.new_err;
        earlier.new_state = removed.new_state;
    }
    compressed
}
