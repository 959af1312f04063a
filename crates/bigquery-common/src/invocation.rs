//! Process-wide invocation identity.
//!
//! Every job submitted during one adapter invocation carries the same
//! identifier label so jobs can be attributed to the run that issued them.

use std::sync::OnceLock;

use uuid::Uuid;

static INVOCATION_ID: OnceLock<Uuid> = OnceLock::new();

/// The identifier of the current invocation, generated on first use.
pub fn invocation_id() -> Uuid {
    *INVOCATION_ID.get_or_init(Uuid::new_v4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_id_is_stable() {
        assert_eq!(invocation_id(), invocation_id());
    }
}
