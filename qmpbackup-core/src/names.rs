//! Deterministic names for the transient monitor nodes a run creates
//! (§3 invariant 4), shared between the Transaction Builder and the
//! Fleecing Controller so both sides agree without passing strings around.

/// Name of the attached target node.
pub fn target_node(node_safe: &str) -> String {
    format!("qmpbackup-{node_safe}")
}

/// Name of the attached fleecing scratch node.
pub fn fleece_node(node: &str) -> String {
    format!("{node}_fleece")
}

/// Name of the copy-before-write filter node.
pub fn cbw_node(node: &str) -> String {
    format!("{node}_cbw")
}

/// Name of the snapshot-access node exposing the pre-backup view.
pub fn snapshot_access_node(node: &str) -> String {
    format!("{node}-snap")
}

/// Job id for a device's block-backup job (§3 invariant 3).
pub fn job_id(node_safe: &str, basename: &str) -> String {
    format!("qmpbackup.{node_safe}.{basename}")
}
