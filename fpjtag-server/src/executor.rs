use fpjtag_protocol::Operation;

use crate::{Programmer, driver::Driver, error::QueueError};

/// Executes `operations` in order and stops at the first failure.
///
/// Operations after the failing one are not executed. Captured scan data of
/// every executed operation is written back into its fields.
pub fn execute_queue<P: Programmer>(
    driver: &mut Driver<P>,
    operations: &mut [Operation],
) -> Result<(), QueueError> {
    for (index, operation) in operations.iter_mut().enumerate() {
        driver.execute(operation).map_err(|source| QueueError {
            index,
            opcode: operation.opcode(),
            source,
        })?;
    }
    log::trace!("Executed {} queued operations", operations.len());
    Ok(())
}

#[cfg(test)]
mod test {
    use fpjtag_protocol::{
        Opcode, ScanCommand, ScanField,
        tap::{Register, TapState},
    };

    use super::*;
    use crate::sim::Loopback;

    fn operations() -> Vec<Operation> {
        vec![
            Operation::StateMove {
                end_state: TapState::Idle,
            },
            Operation::Scan(ScanCommand {
                register: Register::Instruction,
                end_state: TapState::IrPause,
                fields: vec![ScanField::exchange(4, &[0x05])],
            }),
            Operation::Scan(ScanCommand {
                register: Register::Data,
                end_state: TapState::Idle,
                fields: vec![ScanField::exchange(32, &[0xde, 0xad, 0xbe, 0xef])],
            }),
        ]
    }

    #[test]
    fn all_operations_run_in_order() {
        let mut driver = Driver::new(Loopback::new());
        let mut queue = operations();
        execute_queue(&mut driver, &mut queue).unwrap();
        let Operation::Scan(scan) = &queue[2] else {
            unreachable!()
        };
        assert_eq!(
            scan.fields[0].capture.as_deref(),
            Some(&[0xde, 0xad, 0xbe, 0xef][..])
        );
    }

    #[test]
    fn stops_at_first_failure() {
        // call 0 moves to Idle, call 1 is the instruction scan
        let mut driver = Driver::new(Loopback::new().fail_on_call(1));
        let mut queue = operations();
        let err = execute_queue(&mut driver, &mut queue).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.opcode, Opcode::Scan);
        assert_eq!(driver.programmer().calls(), 2);
        let Operation::Scan(scan) = &queue[2] else {
            unreachable!()
        };
        assert_eq!(scan.fields[0].capture.as_deref(), Some(&[0u8; 4][..]));
    }
}
