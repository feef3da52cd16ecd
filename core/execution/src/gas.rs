//! Deterministic gas accounting.
//!
//! Every cost is a pure function of the operation and its operand sizes, so
//! a fixed script with fixed input always burns the same amount of gas.
//! The meter also tracks allocated bytes against an optional memory limit;
//! the counter is cumulative, bounding total bytes allocated rather than
//! peak live memory.

use crate::types::ExecutionError;

/// Metered operation with its size parameter where cost scales with data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasOp {
    /// Charged once per execution, scaled by source length.
    ExecutionBase(usize),
    FunctionCall,
    PropertyAccess,
    ArrayAccess,
    ObjectCreation(usize),
    ArrayCreation(usize),
    StringOperation(usize),
    MathOperation,
    Comparison,
    LoopIteration,
    StorageRead(usize),
    StorageWrite(usize),
    CryptoOperation(usize),
    SecretRead(usize),
    MemoryAllocation(usize),
}

#[derive(Debug, Clone)]
pub struct GasSchedule {
    pub execution_base: u64,
    pub function_call: u64,
    pub property_access: u64,
    pub array_access: u64,
    pub object_creation: u64,
    pub array_creation: u64,
    pub string_operation: u64,
    pub math_operation: u64,
    pub comparison: u64,
    pub loop_iteration: u64,
    pub storage_read: u64,
    pub storage_write: u64,
    pub crypto_operation: u64,
    pub memory_allocation: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self {
            execution_base: 1_000,
            function_call: 100,
            property_access: 10,
            array_access: 20,
            object_creation: 50,
            array_creation: 30,
            string_operation: 5,
            math_operation: 5,
            comparison: 3,
            loop_iteration: 10,
            storage_read: 100,
            storage_write: 200,
            crypto_operation: 500,
            memory_allocation: 10,
        }
    }
}

impl GasSchedule {
    pub fn cost(&self, op: GasOp) -> u64 {
        match op {
            GasOp::ExecutionBase(code_len) => self.execution_base + code_len as u64 / 100,
            GasOp::FunctionCall => self.function_call,
            GasOp::PropertyAccess => self.property_access,
            GasOp::ArrayAccess => self.array_access,
            GasOp::ObjectCreation(n) => self.object_creation + n as u64,
            GasOp::ArrayCreation(n) => self.array_creation + n as u64,
            GasOp::StringOperation(len) => self.string_operation + len as u64 / 100,
            GasOp::MathOperation => self.math_operation,
            GasOp::Comparison => self.comparison,
            GasOp::LoopIteration => self.loop_iteration,
            GasOp::StorageRead(len) => self.storage_read + len as u64 / 1024,
            GasOp::StorageWrite(len) => self.storage_write + len as u64 / 512,
            GasOp::CryptoOperation(len) => self.crypto_operation + len as u64 / 256,
            GasOp::SecretRead(len) => len as u64,
            GasOp::MemoryAllocation(size) => self.memory_allocation + size as u64 / 1024,
        }
    }
}

/// Per-execution gas counter. Consumption is monotonic; execution halts the
/// moment the counter passes the limit.
#[derive(Debug)]
pub struct GasMeter {
    schedule: GasSchedule,
    limit: u64,
    used: u64,
    memory_limit: u64,
    mem_used: u64,
}

impl GasMeter {
    pub fn new(schedule: GasSchedule, limit: u64) -> Self {
        Self {
            schedule,
            limit,
            used: 0,
            memory_limit: u64::MAX,
            mem_used: 0,
        }
    }

    /// Bound cumulative allocation in bytes; unbounded by default.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn charge(&mut self, op: GasOp) -> Result<(), ExecutionError> {
        self.used = self.used.saturating_add(self.schedule.cost(op));
        if self.used > self.limit {
            return Err(ExecutionError::ResourceExhausted {
                gas_used: self.used,
            });
        }
        let alloc_bytes = match op {
            GasOp::MemoryAllocation(size) => size as u64,
            GasOp::StringOperation(len) => len as u64,
            GasOp::ObjectCreation(n) | GasOp::ArrayCreation(n) => n as u64 * 16,
            _ => 0,
        };
        self.mem_used = self.mem_used.saturating_add(alloc_bytes);
        if self.mem_used > self.memory_limit {
            return Err(ExecutionError::ResourceExhausted {
                gas_used: self.used,
            });
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs_scale_with_size() {
        let s = GasSchedule::default();
        assert_eq!(s.cost(GasOp::ExecutionBase(0)), 1_000);
        assert_eq!(s.cost(GasOp::ExecutionBase(250)), 1_002);
        assert_eq!(s.cost(GasOp::ObjectCreation(3)), 53);
        assert_eq!(s.cost(GasOp::StorageRead(2048)), 102);
        assert_eq!(s.cost(GasOp::StorageWrite(1024)), 202);
        assert_eq!(s.cost(GasOp::CryptoOperation(512)), 502);
        assert_eq!(s.cost(GasOp::SecretRead(7)), 7);
    }

    #[test]
    fn test_meter_halts_past_limit() {
        let mut meter = GasMeter::new(GasSchedule::default(), 105);
        meter.charge(GasOp::FunctionCall).unwrap();
        assert_eq!(meter.used(), 100);

        let err = meter.charge(GasOp::LoopIteration).unwrap_err();
        assert_eq!(err, ExecutionError::ResourceExhausted { gas_used: 110 });
        // The counter never moves backwards.
        assert_eq!(meter.used(), 110);
    }

    #[test]
    fn test_exact_limit_is_allowed() {
        let mut meter = GasMeter::new(GasSchedule::default(), 100);
        assert!(meter.charge(GasOp::FunctionCall).is_ok());
    }

    #[test]
    fn test_memory_limit_halts_allocation() {
        let mut meter = GasMeter::new(GasSchedule::default(), u64::MAX).with_memory_limit(1024);
        meter.charge(GasOp::MemoryAllocation(512)).unwrap();
        // Exactly at the limit is still allowed, same as gas.
        meter.charge(GasOp::MemoryAllocation(512)).unwrap();
        assert_eq!(meter.mem_used(), 1024);

        let err = meter.charge(GasOp::MemoryAllocation(1)).unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_string_and_container_ops_count_as_allocation() {
        let mut meter = GasMeter::new(GasSchedule::default(), u64::MAX).with_memory_limit(200);
        meter.charge(GasOp::StringOperation(100)).unwrap();
        meter.charge(GasOp::ArrayCreation(4)).unwrap();
        assert_eq!(meter.mem_used(), 164);
        assert!(meter.charge(GasOp::StringOperation(50)).is_err());
    }
}
