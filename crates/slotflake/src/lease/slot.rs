/// Name prefix of membership entries under the instances path.
pub const INSTANCE_PREFIX: &str = "instance_";

/// Name of the membership entry for `slot`, e.g. `instance_3`.
pub fn node_name(slot: u64) -> String {
    format!("{INSTANCE_PREFIX}{slot}")
}

/// Parses the slot out of a membership entry name. Accepts either a bare
/// name or a full path; returns `None` for anything that is not
/// `instance_<u64>`.
pub fn parse_slot(child: &str) -> Option<u64> {
    let leaf = child.rsplit('/').next().unwrap_or(child);
    leaf.strip_prefix(INSTANCE_PREFIX)?.parse().ok()
}

/// Returns the smallest non-negative slot not present in `slots`.
///
/// The listing order of an ensemble is unspecified, so the slots are sorted
/// (and de-duplicated) in place first. The scan then returns the first index
/// whose value disagrees with its position, or the count when the slots form
/// a contiguous prefix `0..n`.
pub fn smallest_free_slot(slots: &mut Vec<u64>) -> u64 {
    slots.sort_unstable();
    slots.dedup();
    slots
        .iter()
        .zip(0u64..)
        .find_map(|(&slot, index)| (slot != index).then_some(index))
        .unwrap_or(slots.len() as u64)
}
