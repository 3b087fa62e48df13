//! Pure ordering helpers used to rebuild document content from the project log.

use super::value_object::{Operation, OperationGroup, OperationRef};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Canonical rebuild order: erase, then template-bound fields by page and
/// template order, then free-tool edits. Refs whose operation is gone are
/// skipped. With `reverse`, erase and free-tool come most-recent-first.
pub fn order_content(
    refs: &[OperationRef],
    operations: &BTreeMap<u64, Operation>,
    reverse: bool,
) -> Vec<Operation> {
    let mut erase = Vec::new();
    let mut template = Vec::new();
    let mut free_tool = Vec::new();

    for reference in refs {
        let Some(operation) = reference.index().and_then(|index| operations.get(&index)) else {
            continue;
        };
        match operation.group() {
            OperationGroup::Erase => erase.push(operation.clone()),
            OperationGroup::Template => template.push(operation.clone()),
            OperationGroup::FreeTool => free_tool.push(operation.clone()),
        }
    }

    template.sort_by(|a, b| {
        compare_values(a.property("pageId"), b.property("pageId"))
            .then_with(|| compare_values(template_order(a), template_order(b)))
    });

    if reverse {
        erase.reverse();
        free_tool.reverse();
    }

    erase.into_iter().chain(template).chain(free_tool).collect()
}

fn template_order(operation: &Operation) -> Option<&Value> {
    operation
        .property("template")
        .and_then(|template| template.get("order"))
}

// Missing values sort first, numbers before strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// First log position whose timestamp is later than `mode_timestamp`.
pub fn cut_position(log: &[Operation], mode_timestamp: i64) -> usize {
    log.iter()
        .position(|operation| {
            operation
                .timestamp
                .is_some_and(|timestamp| timestamp > mode_timestamp)
        })
        .unwrap_or(log.len())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebuildOutcome {
    pub kept: Vec<Operation>,
    pub removed: Vec<Operation>,
}

impl RebuildOutcome {
    /// Index of the first removed operation, where truncation starts.
    pub fn truncate_from(&self) -> Option<u64> {
        self.removed.first().and_then(|operation| operation.index)
    }

    pub fn kept_refs(&self) -> Vec<OperationRef> {
        self.kept
            .iter()
            .map(|operation| OperationRef::new(super::Channel::Project, operation))
            .collect()
    }
}

/// Splits the log at `cut`; everything from `cut` on is rolled back.
pub fn rebuild(old_log: &[Operation], cut: usize) -> RebuildOutcome {
    let cut = cut.min(old_log.len());
    RebuildOutcome {
        kept: old_log[..cut].to_vec(),
        removed: old_log[cut..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::Channel;
    use serde_json::json;

    fn log_of(ops: Vec<Operation>) -> (Vec<OperationRef>, BTreeMap<u64, Operation>) {
        let mut map = BTreeMap::new();
        let mut refs = Vec::new();
        for (position, op) in ops.into_iter().enumerate() {
            let op = op.with_index(position as u64 + 1);
            refs.push(OperationRef::new(Channel::Project, &op));
            map.insert(op.index.unwrap_or_default(), op);
        }
        (refs, map)
    }

    fn field(page: i64, order: i64) -> Operation {
        Operation::new(Channel::Project, "field")
            .with_group("template")
            .with_property("pageId", json!(page))
            .with_property("template", json!({"order": order}))
    }

    fn indices(ops: &[Operation]) -> Vec<u64> {
        ops.iter().filter_map(|op| op.index).collect()
    }

    #[test]
    fn buckets_are_concatenated_erase_template_free() {
        let (refs, map) = log_of(vec![
            Operation::new(Channel::Project, "text"),
            field(2, 1),
            Operation::new(Channel::Project, "erase").with_group("erase"),
            field(1, 5),
            Operation::new(Channel::Project, "line").with_group("tools"),
            field(1, 2),
        ]);
        let forward = order_content(&refs, &map, false);
        assert_eq!(indices(&forward), vec![3, 6, 4, 2, 1, 5]);

        let reversed = order_content(&refs, &map, true);
        assert_eq!(indices(&reversed), vec![3, 6, 4, 2, 5, 1]);
    }

    #[test]
    fn dangling_refs_are_skipped() {
        let (refs, mut map) = log_of(vec![
            Operation::new(Channel::Project, "text"),
            Operation::new(Channel::Project, "text"),
        ]);
        map.remove(&1);
        let ordered = order_content(&refs, &map, true);
        assert_eq!(indices(&ordered), vec![2]);
    }

    #[test]
    fn ordering_is_idempotent() {
        let (refs, map) = log_of(vec![field(3, 1), field(1, 1), Operation::default()]);
        assert_eq!(
            order_content(&refs, &map, true),
            order_content(&refs, &map, true)
        );
    }

    #[test]
    fn rebuild_cuts_after_mode_timestamp() {
        let log: Vec<Operation> = [10, 20, 30, 40]
            .into_iter()
            .enumerate()
            .map(|(i, ts)| {
                Operation::new(Channel::Project, "text")
                    .with_index(i as u64 + 1)
                    .with_timestamp(ts)
            })
            .collect();
        let cut = cut_position(&log, 25);
        assert_eq!(cut, 2);
        let outcome = rebuild(&log, cut);
        assert_eq!(indices(&outcome.kept), vec![1, 2]);
        assert_eq!(indices(&outcome.removed), vec![3, 4]);
        assert_eq!(outcome.truncate_from(), Some(3));
        assert_eq!(outcome.kept_refs().len(), 2);
        assert!(outcome
            .kept
            .iter()
            .all(|op| op.timestamp.unwrap_or_default() <= 25));
    }

    #[test]
    fn rebuild_with_cut_past_end_keeps_everything() {
        let log = vec![Operation::new(Channel::Project, "text").with_timestamp(5)];
        assert_eq!(cut_position(&log, 5), 1);
        let outcome = rebuild(&log, 10);
        assert_eq!(outcome.kept.len(), 1);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.truncate_from(), None);
    }
}
