pub mod ordering;
pub mod value_object;

pub use ordering::{cut_position, order_content, rebuild, RebuildOutcome};
pub use value_object::{
    Channel, Operation, OperationGroup, OperationId, OperationKind, OperationProperties,
    OperationRef,
};
