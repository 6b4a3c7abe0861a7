use arbor_core::Command;
use arbor_store::LockSet;

/// The addresses a command must hold exclusively while it executes: the
/// changed address of every member, minus those already covered by an
/// ancestor in the set.
pub fn lock_set(command: &Command) -> LockSet {
    LockSet::covering(command.changed_addresses())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{Address, AtomicCommand, Precondition, TransactionCommand};
    use serde_json::json;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_atomic_command_locks_changed_address() {
        let cmd: Command = AtomicCommand::add_entity(addr("/r/m/o"), Precondition::Forced)
            .unwrap()
            .into();
        assert_eq!(lock_set(&cmd).addresses(), &[addr("/r/m/o")]);
    }

    #[test]
    fn test_transaction_locks_minimal_cover() {
        let txn: Command = TransactionCommand::new(
            addr("/r/m"),
            vec![
                AtomicCommand::add_entity(addr("/r/m/o"), Precondition::SafeStateBound).unwrap(),
                AtomicCommand::add_entity(addr("/r/m/o/f"), Precondition::SafeStateBound).unwrap(),
                AtomicCommand::add_value(addr("/r/m/o/f"), json!(1), Precondition::Forced).unwrap(),
                AtomicCommand::add_entity(addr("/r/m/p"), Precondition::SafeStateBound).unwrap(),
            ],
        )
        .unwrap()
        .into();

        let locks = lock_set(&txn);
        assert_eq!(locks.addresses(), &[addr("/r/m/o"), addr("/r/m/p")]);
    }
}
