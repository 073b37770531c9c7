//! AML bytecode interpreter.
//!
//! The platform describes itself in AML; this module parses DSDT/SSDT
//! bodies into a namespace and evaluates control methods against it.

pub mod convert;
pub mod name;
pub mod namespace;
pub mod node;
pub mod opregion;
pub mod parser;
pub mod stream;

pub use convert::{convert_node, CONV_BUFFER, CONV_INTEGER, CONV_STRING};
pub use name::{AbsPath, NameSeg, NameString};
pub use namespace::Namespace;
pub use node::{
    make_ref, AddressSpace, AmlMutexState, FieldUnit, FieldUnitKind, Method, Node, NodeRef,
    OpRegion, PackageElement,
};
pub use parser::{evaluate_node, method_call, parse_table};
