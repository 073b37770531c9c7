//! AML data objects.
//!
//! Namespace values form a tagged union; shared children (buffers,
//! package elements, field-unit targets) are held through refcounted
//! handles. The namespace itself is a tree, so reference cycles cannot
//! form: references only point from objects to namespace entries.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::name::{AbsPath, NameString};

/// A refcount-managed handle to a namespace node.
pub type NodeRef = Arc<Mutex<Node>>;

/// Shared byte storage for strings and buffers.
pub type Buffer = Arc<Mutex<Vec<u8>>>;

pub fn make_ref(node: Node) -> NodeRef {
    Arc::new(Mutex::new(node))
}

pub fn make_buffer(bytes: Vec<u8>) -> Buffer {
    Arc::new(Mutex::new(bytes))
}

/// OpRegion address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    SystemMemory,
    SystemIo,
    PciConfig,
    EmbeddedController,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    PlatformCommunicationChannel,
    Unknown(u8),
}

impl AddressSpace {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AddressSpace::SystemMemory,
            1 => AddressSpace::SystemIo,
            2 => AddressSpace::PciConfig,
            3 => AddressSpace::EmbeddedController,
            4 => AddressSpace::SmBus,
            5 => AddressSpace::SystemCmos,
            6 => AddressSpace::PciBarTarget,
            7 => AddressSpace::Ipmi,
            8 => AddressSpace::GeneralPurposeIo,
            9 => AddressSpace::GenericSerialBus,
            10 => AddressSpace::PlatformCommunicationChannel,
            other => AddressSpace::Unknown(other),
        }
    }
}

/// A window into a hardware address space.
#[derive(Debug, Clone)]
pub struct OpRegion {
    pub address_space: AddressSpace,
    pub offset: u64,
    pub length: u64,
    /// Scope the region was declared in; PCIConfig regions resolve
    /// `_SEG`/`_BBN`/`_ADR` relative to it.
    pub scope: AbsPath,
}

/// What a field unit is carved out of.
#[derive(Debug, Clone)]
pub enum FieldUnitKind {
    Field {
        region: OpRegion,
    },
    IndexField {
        index: NodeRef,
        data: NodeRef,
    },
    BankField {
        region: OpRegion,
        bank_selector: NodeRef,
        bank_value: u64,
    },
}

/// A bit slice within an OpRegion (or an index/bank indirection).
#[derive(Debug, Clone)]
pub struct FieldUnit {
    pub kind: FieldUnitKind,
    pub bit_offset: u64,
    pub bit_count: u64,
    /// Raw field flags byte: access size, lock, update rule.
    pub flags: u8,
}

/// A control method: flags plus its bytecode.
#[derive(Debug, Clone)]
pub struct Method {
    pub arg_count: u8,
    pub serialized: bool,
    pub sync_level: u8,
    pub body: Arc<Vec<u8>>,
    /// The method's own namespace path; the body executes with this
    /// scope.
    pub scope: AbsPath,
    /// Implicit mutex for serialized methods.
    pub mutex: Option<Arc<AmlMutexState>>,
}

/// Mutex backing for `Mutex` objects and serialized methods.
#[derive(Debug)]
pub struct AmlMutexState {
    pub sync_level: u8,
    locked: AtomicBool,
}

impl AmlMutexState {
    pub fn new(sync_level: u8) -> Self {
        Self {
            sync_level,
            locked: AtomicBool::new(false),
        }
    }

    /// Try to acquire within `timeout_ms` (0xFFFF means forever).
    /// Returns `true` on success.
    pub fn acquire(&self, timeout_ms: u16) -> bool {
        let deadline = (timeout_ms != 0xFFFF)
            .then(|| crate::time::Deadline::after_ms(timeout_ms as u64));
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            if let Some(deadline) = &deadline {
                if deadline.is_expired() {
                    return false;
                }
            }
            core::hint::spin_loop();
        }
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A package element; names inside packages stay unresolved until
/// first use.
#[derive(Debug, Clone)]
pub enum PackageElement {
    Resolved(NodeRef),
    Unresolved(NameString),
}

pub type Package = Arc<Mutex<Vec<PackageElement>>>;

/// The namespace node union.
#[derive(Debug, Clone)]
pub enum Node {
    Uninitialized,
    Integer(u64),
    String(Buffer),
    Buffer(Buffer),
    Package(Package),
    /// A bit slice of a buffer created by CreateField and friends.
    BufferField {
        buffer: Buffer,
        bit_offset: u64,
        bit_count: u64,
    },
    FieldUnit(FieldUnit),
    OpRegion(OpRegion),
    Method(Method),
    Mutex(Arc<AmlMutexState>),
    Event,
    Device,
    Processor {
        id: u8,
    },
    PowerResource,
    ThermalZone,
    /// Root-level predefined scopes (`\_SB_` and friends).
    PredefinedScope,
    /// An object reference produced by RefOf / Index / CondRefOf.
    Reference(NodeRef),
}

impl Node {
    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Uninitialized => "Uninitialized",
            Node::Integer(_) => "Integer",
            Node::String(_) => "String",
            Node::Buffer(_) => "Buffer",
            Node::Package(_) => "Package",
            Node::BufferField { .. } => "BufferField",
            Node::FieldUnit(_) => "FieldUnit",
            Node::OpRegion(_) => "OpRegion",
            Node::Method(_) => "Method",
            Node::Mutex(_) => "Mutex",
            Node::Event => "Event",
            Node::Device => "Device",
            Node::Processor { .. } => "Processor",
            Node::PowerResource => "PowerResource",
            Node::ThermalZone => "ThermalZone",
            Node::PredefinedScope => "Scope",
            Node::Reference(_) => "Reference",
        }
    }

    pub fn string(text: &str) -> Node {
        Node::String(make_buffer(text.as_bytes().to_vec()))
    }

    pub fn buffer(bytes: Vec<u8>) -> Node {
        Node::Buffer(make_buffer(bytes))
    }

    /// Whether this node opens a scope children can live under.
    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            Node::Device
                | Node::Processor { .. }
                | Node::PowerResource
                | Node::ThermalZone
                | Node::PredefinedScope
        )
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Node::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Node::String(buffer) => {
                Some(String::from_utf8_lossy(buffer.lock().as_slice()).into_owned())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_acquire_release() {
        let mutex = AmlMutexState::new(0);
        assert!(mutex.acquire(0xFFFF));
        assert!(!mutex.acquire(0), "Second acquire must time out immediately");
        mutex.release();
        assert!(mutex.acquire(0));
    }

    #[test]
    fn test_address_space_decoding() {
        assert_eq!(AddressSpace::from_u8(0), AddressSpace::SystemMemory);
        assert_eq!(AddressSpace::from_u8(3), AddressSpace::EmbeddedController);
        assert_eq!(AddressSpace::from_u8(0x7F), AddressSpace::Unknown(0x7F));
    }
}
