//! AML bytecode interpreter.
//!
//! Tables and method bodies are TermLists; each TermObj is a namespace
//! modifier (Alias/Name/Scope), a named object (OpRegion, Field,
//! Device, Method, ...), or an executable opcode. The interpreter
//! evaluates expressions directly off the byte stream — there is no
//! intermediate AST. Nesting depth is budgeted explicitly so deeply
//! nested tables cannot blow the kernel stack.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};

use super::convert::{convert_node, CONV_BUFFER, CONV_INTEGER, CONV_STRING};
use super::name::{can_parse_name_string, parse_name_string, AbsPath, NameString};
use super::namespace::Namespace;
use super::node::{
    make_buffer, make_ref, AddressSpace, AmlMutexState, FieldUnit, FieldUnitKind, Method, Node,
    NodeRef, OpRegion, PackageElement,
};
use super::opregion::{self, store_to_field_unit};
use super::stream::{
    parse_pkg, parse_pkg_length, peek_byte, take_byte, take_bytes, take_u16, take_u32, take_u64,
};

/// One-byte opcodes.
mod op {
    pub const ZERO: u8 = 0x00;
    pub const ONE: u8 = 0x01;
    pub const ALIAS: u8 = 0x06;
    pub const NAME: u8 = 0x08;
    pub const BYTE_PREFIX: u8 = 0x0A;
    pub const WORD_PREFIX: u8 = 0x0B;
    pub const DWORD_PREFIX: u8 = 0x0C;
    pub const STRING_PREFIX: u8 = 0x0D;
    pub const QWORD_PREFIX: u8 = 0x0E;
    pub const SCOPE: u8 = 0x10;
    pub const BUFFER: u8 = 0x11;
    pub const PACKAGE: u8 = 0x12;
    pub const VAR_PACKAGE: u8 = 0x13;
    pub const METHOD: u8 = 0x14;
    pub const EXT_PREFIX: u8 = 0x5B;
    pub const STORE: u8 = 0x70;
    pub const REF_OF: u8 = 0x71;
    pub const ADD: u8 = 0x72;
    pub const CONCAT: u8 = 0x73;
    pub const SUBTRACT: u8 = 0x74;
    pub const INCREMENT: u8 = 0x75;
    pub const DECREMENT: u8 = 0x76;
    pub const MULTIPLY: u8 = 0x77;
    pub const DIVIDE: u8 = 0x78;
    pub const SHIFT_LEFT: u8 = 0x79;
    pub const SHIFT_RIGHT: u8 = 0x7A;
    pub const AND: u8 = 0x7B;
    pub const NAND: u8 = 0x7C;
    pub const OR: u8 = 0x7D;
    pub const NOR: u8 = 0x7E;
    pub const XOR: u8 = 0x7F;
    pub const NOT: u8 = 0x80;
    pub const FIND_SET_LEFT_BIT: u8 = 0x81;
    pub const FIND_SET_RIGHT_BIT: u8 = 0x82;
    pub const DEREF_OF: u8 = 0x83;
    pub const CONCAT_RES: u8 = 0x84;
    pub const MOD: u8 = 0x85;
    pub const NOTIFY: u8 = 0x86;
    pub const SIZE_OF: u8 = 0x87;
    pub const INDEX: u8 = 0x88;
    pub const MATCH: u8 = 0x89;
    pub const CREATE_DWORD_FIELD: u8 = 0x8A;
    pub const CREATE_WORD_FIELD: u8 = 0x8B;
    pub const CREATE_BYTE_FIELD: u8 = 0x8C;
    pub const CREATE_BIT_FIELD: u8 = 0x8D;
    pub const OBJECT_TYPE: u8 = 0x8E;
    pub const CREATE_QWORD_FIELD: u8 = 0x8F;
    pub const LAND: u8 = 0x90;
    pub const LOR: u8 = 0x91;
    pub const LNOT: u8 = 0x92;
    pub const LEQUAL: u8 = 0x93;
    pub const LGREATER: u8 = 0x94;
    pub const LLESS: u8 = 0x95;
    pub const TO_BUFFER: u8 = 0x96;
    pub const TO_DECIMAL_STRING: u8 = 0x97;
    pub const TO_HEX_STRING: u8 = 0x98;
    pub const TO_INTEGER: u8 = 0x99;
    pub const TO_STRING: u8 = 0x9C;
    pub const COPY_OBJECT: u8 = 0x9D;
    pub const MID: u8 = 0x9E;
    pub const CONTINUE: u8 = 0x9F;
    pub const IF: u8 = 0xA0;
    pub const ELSE: u8 = 0xA1;
    pub const WHILE: u8 = 0xA2;
    pub const NOOP: u8 = 0xA3;
    pub const RETURN: u8 = 0xA4;
    pub const BREAK: u8 = 0xA5;
    pub const BREAKPOINT: u8 = 0xCC;
    pub const ONES: u8 = 0xFF;
}

/// Opcodes following the 0x5B extension prefix.
mod ext_op {
    pub const MUTEX: u8 = 0x01;
    pub const EVENT: u8 = 0x02;
    pub const COND_REF_OF: u8 = 0x12;
    pub const CREATE_FIELD: u8 = 0x13;
    pub const STALL: u8 = 0x21;
    pub const SLEEP: u8 = 0x22;
    pub const ACQUIRE: u8 = 0x23;
    pub const SIGNAL: u8 = 0x24;
    pub const WAIT: u8 = 0x25;
    pub const RESET: u8 = 0x26;
    pub const RELEASE: u8 = 0x27;
    pub const FATAL: u8 = 0x32;
    pub const TIMER: u8 = 0x33;
    pub const OPREGION: u8 = 0x80;
    pub const FIELD: u8 = 0x81;
    pub const DEVICE: u8 = 0x82;
    pub const PROCESSOR: u8 = 0x83;
    pub const POWER_RES: u8 = 0x84;
    pub const THERMAL_ZONE: u8 = 0x85;
    pub const INDEX_FIELD: u8 = 0x86;
    pub const BANK_FIELD: u8 = 0x87;
}

/// Explicit stack budget for nested scopes, packages and expressions.
const MAX_NESTING: u32 = 128;

/// Guard against non-terminating While loops in buggy firmware.
const MAX_WHILE_ITERATIONS: u32 = 100_000;

/// Control-flow outcome of a TermList.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Node),
}

pub struct ParseContext<'ns> {
    pub ns: &'ns mut Namespace,
    pub scope: AbsPath,
    args: [Option<NodeRef>; 7],
    locals: [Option<NodeRef>; 8],
    depth: u32,
}

impl<'ns> ParseContext<'ns> {
    fn new(ns: &'ns mut Namespace, scope: AbsPath) -> Self {
        Self {
            ns,
            scope,
            args: Default::default(),
            locals: Default::default(),
            depth: 0,
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            log::warn!("aml: nesting budget exceeded");
            return Err(KernelError::NotSupported);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }
}

/// Storage destinations for Store and expression targets.
enum Target {
    Null,
    Local(usize),
    Arg(usize),
    Named { path: AbsPath, node: NodeRef },
    Debug,
}

// ---------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------

/// Parse a whole table body (DSDT/SSDT/PSDT after the header) into the
/// namespace.
pub fn parse_table(ns: &mut Namespace, body: &[u8]) -> Result<()> {
    let mut ctx = ParseContext::new(ns, AbsPath::root());
    let mut data = body;
    match exec_term_list(&mut ctx, &mut data)? {
        Flow::Normal => Ok(()),
        other => {
            log::warn!("aml: table body ended with {:?}", other);
            Ok(())
        }
    }
}

/// Invoke a method with up to 7 argument references.
pub fn method_call(
    ns: &mut Namespace,
    path: &AbsPath,
    method: &Method,
    args: [Option<NodeRef>; 7],
) -> Result<Node> {
    if let Some(mutex) = &method.mutex {
        if !mutex.acquire(0xFFFF) {
            return Err(KernelError::DeviceTimeout);
        }
    }

    let result = (|| {
        let mut ctx = ParseContext::new(ns, path.clone());
        ctx.args = args;
        let body = method.body.clone();
        let mut data: &[u8] = &body;
        match exec_term_list(&mut ctx, &mut data)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Node::Integer(0)),
        }
    })();

    if let Some(mutex) = &method.mutex {
        mutex.release();
    }

    result
}

/// Evaluate a namespace node to a value: zero-argument methods are
/// invoked, field units are read out, data objects pass through.
pub fn evaluate_node(ns: &mut Namespace, path: &AbsPath, node_ref: &NodeRef) -> Result<Node> {
    let node = node_ref.lock().clone();
    match node {
        Node::Method(method) => {
            if method.arg_count != 0 {
                log::warn!("aml: {} needs {} arguments", path, method.arg_count);
                return Err(KernelError::InvalidInput);
            }
            method_call(ns, path, &method, Default::default())
        }
        Node::FieldUnit(field) => {
            opregion::convert_from_field_unit(ns, &field, CONV_INTEGER | CONV_BUFFER, 8)
        }
        Node::BufferField {
            buffer,
            bit_offset,
            bit_count,
        } => {
            let bytes = buffer.lock();
            Ok(Node::Integer(opregion::read_bits_from_buffer(
                &bytes,
                bit_offset as usize,
                bit_count as usize,
            )))
        }
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------
// TermList execution
// ---------------------------------------------------------------------

fn exec_term_list(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    ctx.enter()?;
    let result = loop {
        if data.is_empty() {
            break Ok(Flow::Normal);
        }
        match exec_term_obj(ctx, data) {
            Ok(Flow::Normal) => continue,
            other => break other,
        }
    };
    ctx.leave();
    result
}

fn exec_term_obj(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    match peek_byte(data)? {
        op::NAME => {
            take_byte(data)?;
            let name = parse_name_string(data)?;
            let value = parse_node(ctx, data)?;
            ctx.ns.add(&ctx.scope, &name, value)?;
            Ok(Flow::Normal)
        }
        op::ALIAS => {
            take_byte(data)?;
            let source = parse_name_string(data)?;
            let alias = parse_name_string(data)?;
            let (_, node) = ctx
                .ns
                .find(&ctx.scope, &source, true)
                .ok_or(KernelError::NotFound)?;
            let alias_path = alias.resolve_from(&ctx.scope)?;
            ctx.ns.insert_abs(alias_path, node)?;
            Ok(Flow::Normal)
        }
        op::SCOPE => {
            take_byte(data)?;
            let mut body = parse_pkg(data)?;
            let name = parse_name_string(&mut body)?;
            let new_scope = name.resolve_from(&ctx.scope)?;

            let saved = core::mem::replace(&mut ctx.scope, new_scope);
            let flow = exec_term_list(ctx, &mut body);
            ctx.scope = saved;
            flow?;
            Ok(Flow::Normal)
        }
        op::METHOD => {
            take_byte(data)?;
            let mut body = parse_pkg(data)?;
            let name = parse_name_string(&mut body)?;
            let flags = take_byte(&mut body)?;

            let path = name.resolve_from(&ctx.scope)?;
            let serialized = flags & 0x08 != 0;
            let method = Method {
                arg_count: flags & 0x07,
                serialized,
                sync_level: flags >> 4,
                body: Arc::new(body.to_vec()),
                scope: path.clone(),
                mutex: serialized.then(|| Arc::new(AmlMutexState::new(flags >> 4))),
            };
            ctx.ns.insert_abs(path, make_ref(Node::Method(method)))?;
            Ok(Flow::Normal)
        }
        op::IF => {
            take_byte(data)?;
            let mut body = parse_pkg(data)?;
            let predicate = parse_integer(ctx, &mut body)?;

            let taken_flow = if predicate != 0 {
                exec_term_list(ctx, &mut body)?
            } else {
                Flow::Normal
            };

            // An Else block belongs to this If; run it when the
            // predicate was zero.
            let mut else_flow = Flow::Normal;
            if !data.is_empty() && peek_byte(data)? == op::ELSE {
                take_byte(data)?;
                let mut else_body = parse_pkg(data)?;
                if predicate == 0 {
                    else_flow = exec_term_list(ctx, &mut else_body)?;
                }
            }

            match taken_flow {
                Flow::Normal => Ok(else_flow),
                other => Ok(other),
            }
        }
        op::WHILE => {
            take_byte(data)?;
            let body = parse_pkg(data)?;

            for _ in 0..MAX_WHILE_ITERATIONS {
                let mut cursor = body;
                let predicate = parse_integer(ctx, &mut cursor)?;
                if predicate == 0 {
                    return Ok(Flow::Normal);
                }
                match exec_term_list(ctx, &mut cursor)? {
                    Flow::Normal | Flow::Continue => {}
                    Flow::Break => return Ok(Flow::Normal),
                    ret @ Flow::Return(_) => return Ok(ret),
                }
            }
            log::warn!("aml: While exceeded the iteration budget");
            Err(KernelError::DeviceTimeout)
        }
        op::RETURN => {
            take_byte(data)?;
            let value = if !data.is_empty() && can_start_term_arg(data) {
                parse_node(ctx, data)?
            } else {
                Node::Integer(0)
            };
            Ok(Flow::Return(value))
        }
        op::BREAK => {
            take_byte(data)?;
            Ok(Flow::Break)
        }
        op::CONTINUE => {
            take_byte(data)?;
            Ok(Flow::Continue)
        }
        op::NOOP | op::BREAKPOINT => {
            take_byte(data)?;
            Ok(Flow::Normal)
        }
        op::NOTIFY => {
            take_byte(data)?;
            let target = parse_target(ctx, data)?;
            let value = parse_integer(ctx, data)?;
            if let Target::Named { path, .. } = target {
                log::info!("aml: Notify({}, {:#x})", path, value);
            }
            Ok(Flow::Normal)
        }
        op::CREATE_BIT_FIELD => {
            take_byte(data)?;
            exec_create_buffer_field(ctx, data, CreateFieldWidth::Bits(1))
        }
        op::CREATE_BYTE_FIELD => {
            take_byte(data)?;
            exec_create_buffer_field(ctx, data, CreateFieldWidth::Bytes(1))
        }
        op::CREATE_WORD_FIELD => {
            take_byte(data)?;
            exec_create_buffer_field(ctx, data, CreateFieldWidth::Bytes(2))
        }
        op::CREATE_DWORD_FIELD => {
            take_byte(data)?;
            exec_create_buffer_field(ctx, data, CreateFieldWidth::Bytes(4))
        }
        op::CREATE_QWORD_FIELD => {
            take_byte(data)?;
            exec_create_buffer_field(ctx, data, CreateFieldWidth::Bytes(8))
        }
        op::EXT_PREFIX => {
            let mut peeked = *data;
            take_byte(&mut peeked)?;
            match peek_byte(&peeked)? {
                ext_op::MUTEX => {
                    *data = peeked;
                    take_byte(data)?;
                    let name = parse_name_string(data)?;
                    let sync_level = take_byte(data)?;
                    ctx.ns.add(
                        &ctx.scope,
                        &name,
                        Node::Mutex(Arc::new(AmlMutexState::new(sync_level & 0x0F))),
                    )?;
                    Ok(Flow::Normal)
                }
                ext_op::EVENT => {
                    *data = peeked;
                    take_byte(data)?;
                    let name = parse_name_string(data)?;
                    ctx.ns.add(&ctx.scope, &name, Node::Event)?;
                    Ok(Flow::Normal)
                }
                ext_op::OPREGION => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_opregion(ctx, data)
                }
                ext_op::FIELD => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_field(ctx, data)
                }
                ext_op::INDEX_FIELD => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_index_field(ctx, data)
                }
                ext_op::BANK_FIELD => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_bank_field(ctx, data)
                }
                ext_op::CREATE_FIELD => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_create_buffer_field(ctx, data, CreateFieldWidth::Variable)
                }
                ext_op::DEVICE => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_scoped_object(ctx, data, ScopedKind::Device)
                }
                ext_op::PROCESSOR => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_scoped_object(ctx, data, ScopedKind::Processor)
                }
                ext_op::POWER_RES => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_scoped_object(ctx, data, ScopedKind::PowerResource)
                }
                ext_op::THERMAL_ZONE => {
                    *data = peeked;
                    take_byte(data)?;
                    exec_scoped_object(ctx, data, ScopedKind::ThermalZone)
                }
                ext_op::RELEASE => {
                    *data = peeked;
                    take_byte(data)?;
                    let target = parse_target(ctx, data)?;
                    if let Target::Named { node, .. } = target {
                        if let Node::Mutex(mutex) = &*node.lock() {
                            mutex.release();
                        }
                    }
                    Ok(Flow::Normal)
                }
                ext_op::SLEEP => {
                    *data = peeked;
                    take_byte(data)?;
                    let ms = parse_integer(ctx, data)?;
                    crate::time::sleep_ms(ms);
                    Ok(Flow::Normal)
                }
                ext_op::STALL => {
                    *data = peeked;
                    take_byte(data)?;
                    let us = parse_integer(ctx, data)?;
                    // Millisecond clock; round sub-millisecond stalls up.
                    crate::time::sleep_ms(us.div_ceil(1000).max(1));
                    Ok(Flow::Normal)
                }
                ext_op::SIGNAL | ext_op::RESET => {
                    *data = peeked;
                    take_byte(data)?;
                    let _event = parse_target(ctx, data)?;
                    Ok(Flow::Normal)
                }
                ext_op::FATAL => {
                    *data = peeked;
                    take_byte(data)?;
                    let fatal_type = take_byte(data)?;
                    let code = take_u32(data)?;
                    let arg = parse_integer(ctx, data)?;
                    log::error!(
                        "aml: Fatal(type={:#x}, code={:#x}, arg={:#x})",
                        fatal_type,
                        code,
                        arg
                    );
                    Ok(Flow::Normal)
                }
                // Expression-level extended ops used as statements.
                _ => {
                    parse_node(ctx, data)?;
                    Ok(Flow::Normal)
                }
            }
        }
        // Anything else is an expression evaluated for its side
        // effects (Store, method invocation, arithmetic with targets).
        _ => {
            parse_node(ctx, data)?;
            Ok(Flow::Normal)
        }
    }
}

// ---------------------------------------------------------------------
// Named object helpers
// ---------------------------------------------------------------------

enum ScopedKind {
    Device,
    Processor,
    PowerResource,
    ThermalZone,
}

fn exec_scoped_object(
    ctx: &mut ParseContext,
    data: &mut &[u8],
    kind: ScopedKind,
) -> Result<Flow> {
    let mut body = parse_pkg(data)?;
    let name = parse_name_string(&mut body)?;
    let path = name.resolve_from(&ctx.scope)?;

    let node = match kind {
        ScopedKind::Device => Node::Device,
        ScopedKind::Processor => {
            let id = take_byte(&mut body)?;
            let _pblk_address = take_u32(&mut body)?;
            let _pblk_length = take_byte(&mut body)?;
            Node::Processor { id }
        }
        ScopedKind::PowerResource => {
            let _system_level = take_byte(&mut body)?;
            let _resource_order = take_u16(&mut body)?;
            Node::PowerResource
        }
        ScopedKind::ThermalZone => Node::ThermalZone,
    };

    ctx.ns.insert_abs(path.clone(), make_ref(node))?;

    let saved = core::mem::replace(&mut ctx.scope, path);
    let flow = exec_term_list(ctx, &mut body);
    ctx.scope = saved;
    flow?;
    Ok(Flow::Normal)
}

fn exec_opregion(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    let name = parse_name_string(data)?;
    let space = take_byte(data)?;
    let offset = parse_integer(ctx, data)?;
    let length = parse_integer(ctx, data)?;

    let address_space = AddressSpace::from_u8(space);
    if let AddressSpace::Unknown(value) = address_space {
        log::warn!("aml: OpRegion {} in unknown address space {:#x}", name, value);
    }

    ctx.ns.add(
        &ctx.scope,
        &name,
        Node::OpRegion(OpRegion {
            address_space,
            offset,
            length,
            scope: ctx.scope.clone(),
        }),
    )?;
    Ok(Flow::Normal)
}

/// Walk a FieldList, creating one field unit per NameSeg entry.
fn parse_field_list(
    ctx: &mut ParseContext,
    mut list: &[u8],
    default_flags: u8,
    make_node: impl Fn(u64, u64, u8) -> Node,
) -> Result<()> {
    let mut flags = default_flags;
    let mut bit_offset = 0u64;

    while !list.is_empty() {
        match peek_byte(list)? {
            0x00 => {
                // ReservedField: skip pkg_length bits.
                take_byte(&mut list)?;
                bit_offset += parse_pkg_length(&mut list)? as u64;
            }
            0x01 => {
                // AccessField: override the access type.
                take_byte(&mut list)?;
                let access_type = take_byte(&mut list)?;
                let _access_attrib = take_byte(&mut list)?;
                flags = (flags & 0xF0) | (access_type & 0x0F);
            }
            0x02 | 0x03 => {
                log::warn!("aml: connect/extended access fields are not supported");
                return Err(KernelError::NotSupported);
            }
            _ => {
                let seg_bytes = take_bytes(&mut list, 4)?;
                let seg = super::name::NameSeg([
                    seg_bytes[0],
                    seg_bytes[1],
                    seg_bytes[2],
                    seg_bytes[3],
                ]);
                let bit_count = parse_pkg_length(&mut list)? as u64;

                let node = make_node(bit_offset, bit_count, flags);
                ctx.ns.add(&ctx.scope, &NameString::single(seg), node)?;

                bit_offset += bit_count;
            }
        }
    }

    Ok(())
}

fn exec_field(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    let mut body = parse_pkg(data)?;
    let region_name = parse_name_string(&mut body)?;
    let flags = take_byte(&mut body)?;

    let (_, region_ref) = ctx
        .ns
        .find(&ctx.scope, &region_name, true)
        .ok_or(KernelError::NotFound)?;
    let region = match &*region_ref.lock() {
        Node::OpRegion(region) => region.clone(),
        other => {
            log::warn!("aml: Field source {} is a {}", region_name, other.type_name());
            return Err(KernelError::InvalidInput);
        }
    };

    parse_field_list(ctx, body, flags, |bit_offset, bit_count, field_flags| {
        Node::FieldUnit(FieldUnit {
            kind: FieldUnitKind::Field {
                region: region.clone(),
            },
            bit_offset,
            bit_count,
            flags: field_flags,
        })
    })?;
    Ok(Flow::Normal)
}

fn find_field_unit(ctx: &mut ParseContext, name: &NameString) -> Result<NodeRef> {
    let (_, node_ref) = ctx
        .ns
        .find(&ctx.scope, name, true)
        .ok_or(KernelError::NotFound)?;
    if !matches!(&*node_ref.lock(), Node::FieldUnit(_)) {
        log::warn!("aml: {} is not a field unit", name);
        return Err(KernelError::InvalidInput);
    }
    Ok(node_ref)
}

fn exec_index_field(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    let mut body = parse_pkg(data)?;
    let index_name = parse_name_string(&mut body)?;
    let data_name = parse_name_string(&mut body)?;
    let flags = take_byte(&mut body)?;

    let index = find_field_unit(ctx, &index_name)?;
    let data_field = find_field_unit(ctx, &data_name)?;

    parse_field_list(ctx, body, flags, |bit_offset, bit_count, field_flags| {
        Node::FieldUnit(FieldUnit {
            kind: FieldUnitKind::IndexField {
                index: index.clone(),
                data: data_field.clone(),
            },
            bit_offset,
            bit_count,
            flags: field_flags,
        })
    })?;
    Ok(Flow::Normal)
}

fn exec_bank_field(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Flow> {
    let mut body = parse_pkg(data)?;
    let region_name = parse_name_string(&mut body)?;
    let bank_name = parse_name_string(&mut body)?;
    let bank_value = parse_integer(ctx, &mut body)?;
    let flags = take_byte(&mut body)?;

    let (_, region_ref) = ctx
        .ns
        .find(&ctx.scope, &region_name, true)
        .ok_or(KernelError::NotFound)?;
    let region = match &*region_ref.lock() {
        Node::OpRegion(region) => region.clone(),
        other => {
            log::warn!("aml: BankField source is a {}", other.type_name());
            return Err(KernelError::InvalidInput);
        }
    };
    let bank_selector = find_field_unit(ctx, &bank_name)?;

    parse_field_list(ctx, body, flags, |bit_offset, bit_count, field_flags| {
        Node::FieldUnit(FieldUnit {
            kind: FieldUnitKind::BankField {
                region: region.clone(),
                bank_selector: bank_selector.clone(),
                bank_value,
            },
            bit_offset,
            bit_count,
            flags: field_flags,
        })
    })?;
    Ok(Flow::Normal)
}

enum CreateFieldWidth {
    Bits(u64),
    Bytes(u64),
    /// CreateField: explicit bit count operand.
    Variable,
}

fn exec_create_buffer_field(
    ctx: &mut ParseContext,
    data: &mut &[u8],
    width: CreateFieldWidth,
) -> Result<Flow> {
    let source = parse_node(ctx, data)?;
    let index = parse_integer(ctx, data)?;
    let (bit_offset, bit_count) = match width {
        CreateFieldWidth::Bits(count) => (index, count),
        CreateFieldWidth::Bytes(count) => (index * 8, count * 8),
        CreateFieldWidth::Variable => {
            let bits = parse_integer(ctx, data)?;
            (index, bits)
        }
    };
    let name = parse_name_string(data)?;

    let buffer = match source {
        Node::Buffer(buffer) => buffer,
        other => {
            log::warn!("aml: CreateField source is a {}", other.type_name());
            return Err(KernelError::InvalidInput);
        }
    };

    ctx.ns.add(
        &ctx.scope,
        &name,
        Node::BufferField {
            buffer,
            bit_offset,
            bit_count,
        },
    )?;
    Ok(Flow::Normal)
}

// ---------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------

fn can_start_term_arg(data: &[u8]) -> bool {
    let Some(&b) = data.first() else { return false };
    matches!(
        b,
        op::ZERO
            | op::ONE
            | op::ONES
            | op::BYTE_PREFIX
            | op::WORD_PREFIX
            | op::DWORD_PREFIX
            | op::QWORD_PREFIX
            | op::STRING_PREFIX
            | op::BUFFER
            | op::PACKAGE
            | op::VAR_PACKAGE
            | 0x60..=0x67
            | 0x68..=0x6E
            | op::EXT_PREFIX
            | op::STORE..=op::MID
    ) || can_parse_name_string(data)
}

fn parse_integer(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<u64> {
    let node = parse_node(ctx, data)?;
    convert_node(ctx.ns, node, CONV_INTEGER, 8)?
        .as_integer()
        .ok_or(KernelError::InvalidInput)
}

fn parse_string_bytes(data: &mut &[u8]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        let b = take_byte(data)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(bytes)
}

/// Evaluate one TermArg to a value node.
fn parse_node(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Node> {
    ctx.enter()?;
    let result = parse_node_inner(ctx, data);
    ctx.leave();
    result
}

fn parse_node_inner(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Node> {
    match peek_byte(data)? {
        op::ZERO => {
            take_byte(data)?;
            Ok(Node::Integer(0))
        }
        op::ONE => {
            take_byte(data)?;
            Ok(Node::Integer(1))
        }
        op::ONES => {
            take_byte(data)?;
            Ok(Node::Integer(u64::MAX))
        }
        op::BYTE_PREFIX => {
            take_byte(data)?;
            Ok(Node::Integer(take_byte(data)? as u64))
        }
        op::WORD_PREFIX => {
            take_byte(data)?;
            Ok(Node::Integer(take_u16(data)? as u64))
        }
        op::DWORD_PREFIX => {
            take_byte(data)?;
            Ok(Node::Integer(take_u32(data)? as u64))
        }
        op::QWORD_PREFIX => {
            take_byte(data)?;
            Ok(Node::Integer(take_u64(data)?))
        }
        op::STRING_PREFIX => {
            take_byte(data)?;
            let bytes = parse_string_bytes(data)?;
            Ok(Node::String(make_buffer(bytes)))
        }
        op::BUFFER => {
            take_byte(data)?;
            let mut body = parse_pkg(data)?;
            let size = parse_integer(ctx, &mut body)? as usize;
            let mut bytes = body.to_vec();
            if bytes.len() < size {
                bytes.resize(size, 0);
            }
            Ok(Node::Buffer(make_buffer(bytes)))
        }
        op::PACKAGE | op::VAR_PACKAGE => {
            let variable = take_byte(data)? == op::VAR_PACKAGE;
            let mut body = parse_pkg(data)?;
            let count = if variable {
                parse_integer(ctx, &mut body)? as usize
            } else {
                take_byte(&mut body)? as usize
            };

            let mut elements = Vec::with_capacity(count);
            while !body.is_empty() && elements.len() < count {
                if can_parse_name_string(&body) {
                    let name = parse_name_string(&mut body)?;
                    elements.push(PackageElement::Unresolved(name));
                } else {
                    let node = parse_node(ctx, &mut body)?;
                    elements.push(PackageElement::Resolved(make_ref(node)));
                }
            }
            while elements.len() < count {
                elements.push(PackageElement::Resolved(make_ref(Node::Uninitialized)));
            }

            Ok(Node::Package(Arc::new(spin::Mutex::new(elements))))
        }
        b @ 0x60..=0x67 => {
            take_byte(data)?;
            let slot = (b - 0x60) as usize;
            Ok(match &ctx.locals[slot] {
                Some(node_ref) => node_ref.lock().clone(),
                None => Node::Uninitialized,
            })
        }
        b @ 0x68..=0x6E => {
            take_byte(data)?;
            let slot = (b - 0x68) as usize;
            Ok(match &ctx.args[slot] {
                Some(node_ref) => node_ref.lock().clone(),
                None => Node::Uninitialized,
            })
        }
        op::STORE => {
            take_byte(data)?;
            let value = parse_node(ctx, data)?;
            let target = parse_target(ctx, data)?;
            store_to_target(ctx, &target, value.clone())?;
            Ok(value)
        }
        op::REF_OF => {
            take_byte(data)?;
            let target = parse_target(ctx, data)?;
            match target {
                Target::Named { node, .. } => Ok(Node::Reference(node)),
                Target::Local(slot) => {
                    let node_ref = ctx.locals[slot]
                        .get_or_insert_with(|| make_ref(Node::Uninitialized))
                        .clone();
                    Ok(Node::Reference(node_ref))
                }
                Target::Arg(slot) => {
                    let node_ref = ctx.args[slot]
                        .get_or_insert_with(|| make_ref(Node::Uninitialized))
                        .clone();
                    Ok(Node::Reference(node_ref))
                }
                _ => Err(KernelError::InvalidInput),
            }
        }
        op::ADD
        | op::SUBTRACT
        | op::MULTIPLY
        | op::SHIFT_LEFT
        | op::SHIFT_RIGHT
        | op::AND
        | op::NAND
        | op::OR
        | op::NOR
        | op::XOR
        | op::MOD => {
            let opcode = take_byte(data)?;
            let lhs = parse_integer(ctx, data)?;
            let rhs = parse_integer(ctx, data)?;
            let target = parse_target(ctx, data)?;

            let value = match opcode {
                op::ADD => lhs.wrapping_add(rhs),
                op::SUBTRACT => lhs.wrapping_sub(rhs),
                op::MULTIPLY => lhs.wrapping_mul(rhs),
                op::SHIFT_LEFT => {
                    if rhs >= 64 {
                        0
                    } else {
                        lhs << rhs
                    }
                }
                op::SHIFT_RIGHT => {
                    if rhs >= 64 {
                        0
                    } else {
                        lhs >> rhs
                    }
                }
                op::AND => lhs & rhs,
                op::NAND => !(lhs & rhs),
                op::OR => lhs | rhs,
                op::NOR => !(lhs | rhs),
                op::XOR => lhs ^ rhs,
                op::MOD => {
                    if rhs == 0 {
                        return Err(KernelError::InvalidInput);
                    }
                    lhs % rhs
                }
                _ => unreachable!(),
            };

            store_to_target(ctx, &target, Node::Integer(value))?;
            Ok(Node::Integer(value))
        }
        op::DIVIDE => {
            take_byte(data)?;
            let dividend = parse_integer(ctx, data)?;
            let divisor = parse_integer(ctx, data)?;
            if divisor == 0 {
                log::warn!("aml: division by zero");
                return Err(KernelError::InvalidInput);
            }
            let remainder_target = parse_target(ctx, data)?;
            let quotient_target = parse_target(ctx, data)?;

            store_to_target(ctx, &remainder_target, Node::Integer(dividend % divisor))?;
            let quotient = dividend / divisor;
            store_to_target(ctx, &quotient_target, Node::Integer(quotient))?;
            Ok(Node::Integer(quotient))
        }
        op::INCREMENT | op::DECREMENT => {
            let opcode = take_byte(data)?;
            let target = parse_target(ctx, data)?;
            let current = read_target(ctx, &target)?;
            let current = convert_node(ctx.ns, current, CONV_INTEGER, 8)?
                .as_integer()
                .ok_or(KernelError::InvalidInput)?;
            let value = if opcode == op::INCREMENT {
                current.wrapping_add(1)
            } else {
                current.wrapping_sub(1)
            };
            store_to_target(ctx, &target, Node::Integer(value))?;
            Ok(Node::Integer(value))
        }
        op::NOT => {
            take_byte(data)?;
            let operand = parse_integer(ctx, data)?;
            let target = parse_target(ctx, data)?;
            let value = !operand;
            store_to_target(ctx, &target, Node::Integer(value))?;
            Ok(Node::Integer(value))
        }
        op::FIND_SET_LEFT_BIT => {
            take_byte(data)?;
            let operand = parse_integer(ctx, data)?;
            let target = parse_target(ctx, data)?;
            let value = (64 - operand.leading_zeros()) as u64;
            store_to_target(ctx, &target, Node::Integer(value))?;
            Ok(Node::Integer(value))
        }
        op::FIND_SET_RIGHT_BIT => {
            take_byte(data)?;
            let operand = parse_integer(ctx, data)?;
            let target = parse_target(ctx, data)?;
            let value = if operand == 0 {
                0
            } else {
                operand.trailing_zeros() as u64 + 1
            };
            store_to_target(ctx, &target, Node::Integer(value))?;
            Ok(Node::Integer(value))
        }
        op::LAND | op::LOR => {
            let opcode = take_byte(data)?;
            let lhs = parse_integer(ctx, data)?;
            let rhs = parse_integer(ctx, data)?;
            let result = match opcode {
                op::LAND => lhs != 0 && rhs != 0,
                _ => lhs != 0 || rhs != 0,
            };
            Ok(Node::Integer(if result { u64::MAX } else { 0 }))
        }
        op::LNOT => {
            take_byte(data)?;
            let operand = parse_integer(ctx, data)?;
            Ok(Node::Integer(if operand == 0 { u64::MAX } else { 0 }))
        }
        op::LEQUAL | op::LGREATER | op::LLESS => {
            let opcode = take_byte(data)?;
            let lhs = parse_node(ctx, data)?;
            let rhs = parse_node(ctx, data)?;
            let ordering = compare_nodes(ctx, lhs, rhs)?;
            let result = match opcode {
                op::LEQUAL => ordering == core::cmp::Ordering::Equal,
                op::LGREATER => ordering == core::cmp::Ordering::Greater,
                _ => ordering == core::cmp::Ordering::Less,
            };
            Ok(Node::Integer(if result { u64::MAX } else { 0 }))
        }
        op::SIZE_OF => {
            take_byte(data)?;
            let target = parse_target(ctx, data)?;
            let node = read_target(ctx, &target)?;
            let size = match &node {
                Node::Buffer(buffer) | Node::String(buffer) => buffer.lock().len() as u64,
                Node::Package(elements) => elements.lock().len() as u64,
                Node::Integer(_) => 8,
                other => {
                    log::warn!("aml: SizeOf of a {}", other.type_name());
                    return Err(KernelError::InvalidInput);
                }
            };
            Ok(Node::Integer(size))
        }
        op::INDEX => {
            take_byte(data)?;
            let source = parse_node(ctx, data)?;
            let index = parse_integer(ctx, data)? as usize;
            let target = parse_target(ctx, data)?;

            let reference = match source {
                Node::Package(elements) => {
                    let mut elements = elements.lock();
                    let element = elements.get_mut(index).ok_or(KernelError::InvalidInput)?;
                    match element {
                        PackageElement::Resolved(node_ref) => Node::Reference(node_ref.clone()),
                        PackageElement::Unresolved(name) => {
                            // Lazy package elements stay unresolved;
                            // match the original's bailout.
                            log::warn!("aml: unresolved package element {}", name);
                            return Err(KernelError::NotSupported);
                        }
                    }
                }
                Node::Buffer(buffer) => {
                    if index >= buffer.lock().len() {
                        return Err(KernelError::InvalidInput);
                    }
                    Node::Reference(make_ref(Node::BufferField {
                        buffer,
                        bit_offset: index as u64 * 8,
                        bit_count: 8,
                    }))
                }
                Node::String(buffer) => {
                    if index >= buffer.lock().len() {
                        return Err(KernelError::InvalidInput);
                    }
                    Node::Reference(make_ref(Node::BufferField {
                        buffer,
                        bit_offset: index as u64 * 8,
                        bit_count: 8,
                    }))
                }
                other => {
                    log::warn!("aml: Index into a {}", other.type_name());
                    return Err(KernelError::InvalidInput);
                }
            };

            store_to_target(ctx, &target, reference.clone())?;
            Ok(reference)
        }
        op::DEREF_OF => {
            take_byte(data)?;
            let operand = parse_node(ctx, data)?;
            match operand {
                Node::Reference(node_ref) => {
                    let inner = node_ref.lock().clone();
                    match inner {
                        Node::BufferField {
                            buffer,
                            bit_offset,
                            bit_count,
                        } => {
                            let bytes = buffer.lock();
                            Ok(Node::Integer(opregion::read_bits_from_buffer(
                                &bytes,
                                bit_offset as usize,
                                bit_count as usize,
                            )))
                        }
                        other => Ok(other),
                    }
                }
                other => {
                    log::warn!("aml: DerefOf of a {}", other.type_name());
                    Err(KernelError::InvalidInput)
                }
            }
        }
        op::TO_BUFFER | op::TO_INTEGER | op::TO_HEX_STRING | op::TO_DECIMAL_STRING => {
            let opcode = take_byte(data)?;
            let operand = parse_node(ctx, data)?;
            let target = parse_target(ctx, data)?;

            let converted = match opcode {
                op::TO_BUFFER => convert_node(ctx.ns, operand, CONV_BUFFER, 8)?,
                op::TO_INTEGER => convert_node(ctx.ns, operand, CONV_INTEGER, 8)?,
                op::TO_HEX_STRING => convert_node(ctx.ns, operand, CONV_STRING, 8)?,
                _ => {
                    let value = convert_node(ctx.ns, operand, CONV_INTEGER, 8)?
                        .as_integer()
                        .ok_or(KernelError::InvalidInput)?;
                    Node::string(&alloc::format!("{}", value))
                }
            };
            store_to_target(ctx, &target, converted.clone())?;
            Ok(converted)
        }
        op::TO_STRING => {
            take_byte(data)?;
            let source = parse_node(ctx, data)?;
            let length = parse_integer(ctx, data)? as usize;
            let target = parse_target(ctx, data)?;

            let bytes = match source {
                Node::Buffer(buffer) => buffer.lock().clone(),
                other => {
                    let converted = convert_node(ctx.ns, other, CONV_BUFFER, 8)?;
                    match converted {
                        Node::Buffer(buffer) => buffer.lock().clone(),
                        _ => return Err(KernelError::InvalidInput),
                    }
                }
            };
            let end = bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(bytes.len())
                .min(length);
            let node = Node::Buffer(make_buffer(bytes[..end].to_vec()));
            let node = Node::String(match node {
                Node::Buffer(buffer) => buffer,
                _ => unreachable!(),
            });
            store_to_target(ctx, &target, node.clone())?;
            Ok(node)
        }
        op::MID => {
            take_byte(data)?;
            let source = parse_node(ctx, data)?;
            let index = parse_integer(ctx, data)? as usize;
            let length = parse_integer(ctx, data)? as usize;
            let target = parse_target(ctx, data)?;

            let node = match source {
                Node::Buffer(buffer) => {
                    let bytes = buffer.lock();
                    let start = index.min(bytes.len());
                    let end = (index + length).min(bytes.len());
                    Node::buffer(bytes[start..end].to_vec())
                }
                Node::String(buffer) => {
                    let bytes = buffer.lock();
                    let start = index.min(bytes.len());
                    let end = (index + length).min(bytes.len());
                    Node::String(make_buffer(bytes[start..end].to_vec()))
                }
                other => {
                    log::warn!("aml: Mid of a {}", other.type_name());
                    return Err(KernelError::InvalidInput);
                }
            };
            store_to_target(ctx, &target, node.clone())?;
            Ok(node)
        }
        op::CONCAT => {
            take_byte(data)?;
            let lhs = parse_node(ctx, data)?;
            let rhs = parse_node(ctx, data)?;
            let target = parse_target(ctx, data)?;

            let node = match &lhs {
                Node::String(_) => {
                    let lhs = convert_node(ctx.ns, lhs, CONV_STRING, 8)?;
                    let rhs = convert_node(ctx.ns, rhs, CONV_STRING, 8)?;
                    let mut bytes = match &lhs {
                        Node::String(buffer) => buffer.lock().clone(),
                        _ => unreachable!(),
                    };
                    if let Node::String(buffer) = &rhs {
                        bytes.extend_from_slice(&buffer.lock());
                    }
                    Node::String(make_buffer(bytes))
                }
                _ => {
                    let lhs = convert_node(ctx.ns, lhs, CONV_BUFFER, 8)?;
                    let rhs = convert_node(ctx.ns, rhs, CONV_BUFFER, 8)?;
                    let mut bytes = match &lhs {
                        Node::Buffer(buffer) => buffer.lock().clone(),
                        _ => unreachable!(),
                    };
                    if let Node::Buffer(buffer) = &rhs {
                        bytes.extend_from_slice(&buffer.lock());
                    }
                    Node::buffer(bytes)
                }
            };
            store_to_target(ctx, &target, node.clone())?;
            Ok(node)
        }
        op::OBJECT_TYPE => {
            take_byte(data)?;
            let target = parse_target(ctx, data)?;
            let node = read_target(ctx, &target)?;
            let code = match node {
                Node::Uninitialized => 0u64,
                Node::Integer(_) => 1,
                Node::String(_) => 2,
                Node::Buffer(_) => 3,
                Node::Package(_) => 4,
                Node::FieldUnit(_) => 5,
                Node::Device => 6,
                Node::Event => 7,
                Node::Method(_) => 8,
                Node::Mutex(_) => 9,
                Node::OpRegion(_) => 10,
                Node::PowerResource => 11,
                Node::Processor { .. } => 12,
                Node::ThermalZone => 13,
                Node::BufferField { .. } => 14,
                Node::PredefinedScope | Node::Reference(_) => 0,
            };
            Ok(Node::Integer(code))
        }
        op::COPY_OBJECT => {
            take_byte(data)?;
            let source = parse_node(ctx, data)?;
            let target = parse_target(ctx, data)?;
            store_to_target(ctx, &target, source.clone())?;
            Ok(source)
        }
        op::MATCH | op::CONCAT_RES => {
            log::warn!("aml: opcode {:#x} is not supported", peek_byte(data)?);
            Err(KernelError::NotSupported)
        }
        op::EXT_PREFIX => {
            take_byte(data)?;
            match take_byte(data)? {
                ext_op::ACQUIRE => {
                    let target = parse_target(ctx, data)?;
                    let timeout = take_u16(data)?;
                    let acquired = match &target {
                        Target::Named { node, .. } => match &*node.lock() {
                            Node::Mutex(mutex) => mutex.acquire(timeout),
                            other => {
                                log::warn!("aml: Acquire of a {}", other.type_name());
                                return Err(KernelError::InvalidInput);
                            }
                        },
                        _ => return Err(KernelError::InvalidInput),
                    };
                    // Acquire yields Ones exactly when it timed out.
                    Ok(Node::Integer(if acquired { 0 } else { u64::MAX }))
                }
                ext_op::WAIT => {
                    let _event = parse_target(ctx, data)?;
                    let _timeout = parse_integer(ctx, data)?;
                    Ok(Node::Integer(0))
                }
                ext_op::TIMER => {
                    // 100 ns granularity.
                    Ok(Node::Integer(crate::time::ms_since_boot() * 10_000))
                }
                ext_op::COND_REF_OF => {
                    let name_exists = can_parse_name_string(data);
                    let target_node = if name_exists {
                        let name = parse_name_string(data)?;
                        ctx.ns.find(&ctx.scope, &name, true).map(|(_, node)| node)
                    } else {
                        let target = parse_target(ctx, data)?;
                        match target {
                            Target::Named { node, .. } => Some(node),
                            _ => None,
                        }
                    };
                    let result_target = parse_target(ctx, data)?;

                    match target_node {
                        Some(node) => {
                            store_to_target(ctx, &result_target, Node::Reference(node))?;
                            Ok(Node::Integer(u64::MAX))
                        }
                        None => Ok(Node::Integer(0)),
                    }
                }
                other => {
                    log::warn!("aml: extended opcode {:#x} is not supported", other);
                    Err(KernelError::NotSupported)
                }
            }
        }
        _ if can_parse_name_string(data) => {
            let name = parse_name_string(data)?;
            let (path, node_ref) = ctx.ns.find(&ctx.scope, &name, true).ok_or_else(|| {
                log::warn!("aml: could not find {} in {}", name, ctx.scope);
                KernelError::NotFound
            })?;

            let node = node_ref.lock().clone();
            if let Node::Method(method) = node {
                let mut args: [Option<NodeRef>; 7] = Default::default();
                for slot in args.iter_mut().take(method.arg_count as usize) {
                    let value = parse_node(ctx, data)?;
                    *slot = Some(make_ref(value));
                }
                return method_call(ctx.ns, &path, &method, args);
            }

            evaluate_node(ctx.ns, &path, &node_ref)
        }
        other => {
            log::warn!("aml: unhandled opcode {:#x}", other);
            Err(KernelError::NotSupported)
        }
    }
}

fn compare_nodes(ctx: &mut ParseContext, lhs: Node, rhs: Node) -> Result<core::cmp::Ordering> {
    if let (Node::String(a), Node::String(b)) = (&lhs, &rhs) {
        let a = a.lock().clone();
        let b = b.lock().clone();
        return Ok(a.cmp(&b));
    }

    let a = convert_node(ctx.ns, lhs, CONV_INTEGER, 8)?
        .as_integer()
        .ok_or(KernelError::InvalidInput)?;
    let b = convert_node(ctx.ns, rhs, CONV_INTEGER, 8)?
        .as_integer()
        .ok_or(KernelError::InvalidInput)?;
    Ok(a.cmp(&b))
}

// ---------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------

fn parse_target(ctx: &mut ParseContext, data: &mut &[u8]) -> Result<Target> {
    match peek_byte(data)? {
        0x00 => {
            take_byte(data)?;
            Ok(Target::Null)
        }
        b @ 0x60..=0x67 => {
            take_byte(data)?;
            Ok(Target::Local((b - 0x60) as usize))
        }
        b @ 0x68..=0x6E => {
            take_byte(data)?;
            Ok(Target::Arg((b - 0x68) as usize))
        }
        op::EXT_PREFIX => {
            let mut peeked = *data;
            take_byte(&mut peeked)?;
            if peek_byte(&peeked)? == 0x31 {
                *data = peeked;
                take_byte(data)?;
                return Ok(Target::Debug);
            }
            Err(KernelError::InvalidFormat)
        }
        op::INDEX => {
            // An Index expression used as a store destination.
            let node = parse_node(ctx, data)?;
            match node {
                Node::Reference(node_ref) => Ok(Target::Named {
                    path: AbsPath::root(),
                    node: node_ref,
                }),
                _ => Err(KernelError::InvalidInput),
            }
        }
        _ if can_parse_name_string(data) => {
            let name = parse_name_string(data)?;
            let (path, node) = ctx.ns.find(&ctx.scope, &name, true).ok_or_else(|| {
                log::warn!("aml: target {} not found in {}", name, ctx.scope);
                KernelError::NotFound
            })?;
            Ok(Target::Named { path, node })
        }
        other => {
            log::warn!("aml: invalid target opcode {:#x}", other);
            Err(KernelError::InvalidFormat)
        }
    }
}

fn read_target(ctx: &mut ParseContext, target: &Target) -> Result<Node> {
    match target {
        Target::Null | Target::Debug => Ok(Node::Uninitialized),
        Target::Local(slot) => Ok(ctx.locals[*slot]
            .as_ref()
            .map(|node_ref| node_ref.lock().clone())
            .unwrap_or(Node::Uninitialized)),
        Target::Arg(slot) => Ok(ctx.args[*slot]
            .as_ref()
            .map(|node_ref| node_ref.lock().clone())
            .unwrap_or(Node::Uninitialized)),
        Target::Named { path, node } => evaluate_node(ctx.ns, path, node),
    }
}

fn store_to_target(ctx: &mut ParseContext, target: &Target, value: Node) -> Result<()> {
    match target {
        Target::Null => Ok(()),
        Target::Debug => {
            log::info!("aml: Debug = {}", value.type_name());
            Ok(())
        }
        Target::Local(slot) => {
            ctx.locals[*slot] = Some(make_ref(value));
            Ok(())
        }
        Target::Arg(slot) => {
            ctx.args[*slot] = Some(make_ref(value));
            Ok(())
        }
        Target::Named { node, .. } => {
            let existing = node.lock().clone();
            match existing {
                Node::FieldUnit(field) => store_to_field_unit(ctx.ns, &value, &field),
                Node::BufferField {
                    buffer,
                    bit_offset,
                    bit_count,
                } => {
                    let integer = convert_node(ctx.ns, value, CONV_INTEGER, 8)?
                        .as_integer()
                        .ok_or(KernelError::InvalidInput)?;
                    let mut bytes = buffer.lock();
                    // Clear the field's bits, then OR in the new value.
                    for (i, byte) in bytes.iter_mut().enumerate() {
                        let mut mask = 0xFFu8;
                        let first_bit = (i * 8) as u64;
                        for bit in 0..8u64 {
                            let absolute = first_bit + bit;
                            if absolute >= bit_offset && absolute < bit_offset + bit_count {
                                mask &= !(1 << bit);
                            }
                        }
                        *byte &= mask;
                    }
                    opregion::write_bits_to_buffer(
                        &mut bytes,
                        bit_offset as usize,
                        integer,
                        bit_count as usize,
                    );
                    Ok(())
                }
                _ => {
                    *node.lock() = value;
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acpi::aml::name::NameSeg;

    fn parse(body: &[u8]) -> Namespace {
        let mut ns = Namespace::new();
        parse_table(&mut ns, body).expect("table parses");
        ns
    }

    fn get_node(ns: &Namespace, path: &str) -> Node {
        let name = NameString::from_str(path).unwrap();
        let (_, node) = ns.find(&AbsPath::root(), &name, false).expect("object exists");
        let node = node.lock().clone();
        node
    }

    #[test]
    fn test_name_with_integer() {
        // Name (VAL_, 0x1234)
        let body = [
            op::NAME,
            b'V', b'A', b'L', b'_',
            op::WORD_PREFIX, 0x34, 0x12,
        ];
        let ns = parse(&body);
        assert_eq!(get_node(&ns, "\\VAL_").as_integer(), Some(0x1234));
    }

    #[test]
    fn test_s5_package() {
        // Name (_S5_, Package (2) { 0x05, 0x05 })
        // Package payload: NumElements=2, two byte constants.
        let body = [
            op::NAME,
            b'_', b'S', b'5', b'_',
            op::PACKAGE, 0x06, 0x02,
            op::BYTE_PREFIX, 0x05,
            op::BYTE_PREFIX, 0x05,
        ];
        let ns = parse(&body);

        match get_node(&ns, "\\_S5_") {
            Node::Package(elements) => {
                let elements = elements.lock();
                assert_eq!(elements.len(), 2);
                for element in elements.iter() {
                    match element {
                        PackageElement::Resolved(node_ref) => {
                            assert_eq!(node_ref.lock().as_integer(), Some(5));
                        }
                        other => panic!("unexpected element {:?}", other),
                    }
                }
            }
            other => panic!("expected package, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_scope_and_nested_name() {
        // Scope (\_SB_) { Name (ABCD, One) }
        let mut body = vec![op::SCOPE];
        let inner = [
            b'_', b'S', b'B', b'_',
            op::NAME, b'A', b'B', b'C', b'D', op::ONE,
        ];
        body.push((inner.len() + 1) as u8); // PkgLength, one byte
        body.extend_from_slice(&inner);

        let ns = parse(&body);
        assert_eq!(get_node(&ns, "\\_SB_.ABCD").as_integer(), Some(1));
    }

    #[test]
    fn test_method_with_return_and_arithmetic() {
        // Method (MTH0, 1) { Return (Add (Arg0, 0x10)) }
        let mut body = vec![op::METHOD];
        let inner = [
            b'M', b'T', b'H', b'0',
            0x01, // one argument
            op::RETURN, op::ADD, 0x68, op::BYTE_PREFIX, 0x10, 0x00,
        ];
        body.push((inner.len() + 1) as u8);
        body.extend_from_slice(&inner);

        let mut ns = parse(&body);
        let name = NameString::from_str("\\MTH0").unwrap();
        let (path, node_ref) = ns.find(&AbsPath::root(), &name, false).unwrap();
        let method = match &*node_ref.lock() {
            Node::Method(method) => method.clone(),
            other => panic!("expected method, got {}", other.type_name()),
        };

        let mut args: [Option<NodeRef>; 7] = Default::default();
        args[0] = Some(make_ref(Node::Integer(0x22)));
        let result = method_call(&mut ns, &path, &method, args).unwrap();
        assert_eq!(result.as_integer(), Some(0x32));
    }

    #[test]
    fn test_method_locals_and_while() {
        // Method (CNT0, 0) {
        //   Store (Zero, Local0)
        //   While (LLess (Local0, 0x05)) { Increment (Local0) }
        //   Return (Local0)
        // }
        let mut inner = vec![
            b'C', b'N', b'T', b'0',
            0x00,
            op::STORE, op::ZERO, 0x60,
        ];
        let while_body = [
            op::LLESS, 0x60, op::BYTE_PREFIX, 0x05,
            op::INCREMENT, 0x60,
        ];
        inner.push(op::WHILE);
        inner.push((while_body.len() + 1) as u8);
        inner.extend_from_slice(&while_body);
        inner.extend_from_slice(&[op::RETURN, 0x60]);

        let mut body = vec![op::METHOD];
        body.push((inner.len() + 1) as u8);
        body.extend_from_slice(&inner);

        let mut ns = parse(&body);
        let name = NameString::from_str("\\CNT0").unwrap();
        let (path, node_ref) = ns.find(&AbsPath::root(), &name, false).unwrap();
        let method = match &*node_ref.lock() {
            Node::Method(method) => method.clone(),
            _ => unreachable!(),
        };
        let result = method_call(&mut ns, &path, &method, Default::default()).unwrap();
        assert_eq!(result.as_integer(), Some(5));
    }

    #[test]
    fn test_if_else() {
        // Method (PICK, 1) {
        //   If (Arg0) { Return (0x0A) } Else { Return (0x0B) }
        // }
        let if_body = [op::RETURN, op::BYTE_PREFIX, 0x0A];
        let else_body = [op::RETURN, op::BYTE_PREFIX, 0x0B];

        let mut inner = vec![b'P', b'I', b'C', b'K', 0x01];
        inner.push(op::IF);
        inner.push((if_body.len() + 1 + 1) as u8); // pkg + predicate byte
        inner.push(0x68); // Arg0 predicate
        inner.extend_from_slice(&if_body);
        inner.push(op::ELSE);
        inner.push((else_body.len() + 1) as u8);
        inner.extend_from_slice(&else_body);

        let mut body = vec![op::METHOD];
        body.push((inner.len() + 1) as u8);
        body.extend_from_slice(&inner);

        let mut ns = parse(&body);
        let name = NameString::from_str("\\PICK").unwrap();
        let (path, node_ref) = ns.find(&AbsPath::root(), &name, false).unwrap();
        let method = match &*node_ref.lock() {
            Node::Method(method) => method.clone(),
            _ => unreachable!(),
        };

        for (arg, expected) in [(1u64, 0x0Au64), (0, 0x0B)] {
            let mut args: [Option<NodeRef>; 7] = Default::default();
            args[0] = Some(make_ref(Node::Integer(arg)));
            let result = method_call(&mut ns, &path, &method, args).unwrap();
            assert_eq!(result.as_integer(), Some(expected), "arg {}", arg);
        }
    }

    #[test]
    fn test_opregion_and_field_store() {
        // OperationRegion (REG0, SystemMemory, 0x94000000, 0x10)
        // Field (REG0, AnyAcc, NoLock, Preserve) { FLD0, 16 }
        // Store through the field and read it back.
        crate::acpi::aml::opregion::test_windows::install(0x9400_0000, 0x10);

        let mut body = vec![
            op::EXT_PREFIX, 0x80, // OpRegion
            b'R', b'E', b'G', b'0',
            0x00, // SystemMemory
            op::DWORD_PREFIX, 0x00, 0x00, 0x00, 0x94,
            op::BYTE_PREFIX, 0x10,
        ];

        let field_list = [
            b'F', b'L', b'D', b'0', 0x10, // 16 bits
        ];
        body.extend_from_slice(&[op::EXT_PREFIX, 0x81]);
        let field_body_len = 4 + 1 + field_list.len() + 1; // name + flags + list + pkglen byte
        body.push(field_body_len as u8);
        body.extend_from_slice(b"REG0");
        body.push(0x00); // flags: AnyAcc, NoLock, Preserve
        body.extend_from_slice(&field_list);

        // Store (0xBEEF, FLD0)
        body.extend_from_slice(&[
            op::STORE, op::WORD_PREFIX, 0xEF, 0xBE,
            b'F', b'L', b'D', b'0',
        ]);

        let mut ns = parse(&body);

        let name = NameString::from_str("\\FLD0").unwrap();
        let (path, node_ref) = ns.find(&AbsPath::root(), &name, false).unwrap();
        let value = evaluate_node(&mut ns, &path, &node_ref).unwrap();
        assert_eq!(value.as_integer(), Some(0xBEEF));
    }

    #[test]
    fn test_buffer_literal() {
        // Name (BUF0, Buffer (4) { 1, 2 }) — zero-padded to size.
        let body = [
            op::NAME,
            b'B', b'U', b'F', b'0',
            op::BUFFER, 0x05, op::BYTE_PREFIX, 0x04, 1, 2,
        ];
        let ns = parse(&body);
        match get_node(&ns, "\\BUF0") {
            Node::Buffer(buffer) => assert_eq!(buffer.lock().as_slice(), &[1, 2, 0, 0]),
            other => panic!("expected buffer, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_device_with_hid() {
        // Device (EC0_) { Name (_HID, EisaId ("PNP0C09") = 0x090CD041) }
        let inner = [
            b'E', b'C', b'0', b'_',
            op::NAME, b'_', b'H', b'I', b'D',
            op::DWORD_PREFIX, 0x41, 0xD0, 0x0C, 0x09,
        ];
        let mut body = vec![op::EXT_PREFIX, 0x82];
        body.push((inner.len() + 1) as u8);
        body.extend_from_slice(&inner);

        let ns = parse(&body);
        let devices = ns.find_devices_with_eisa_id("PNP0C09");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].last(), Some(NameSeg(*b"EC0_")));
    }

    #[test]
    fn test_serialized_method_flag() {
        // Method (SER0, 2, Serialized)
        let inner = [b'S', b'E', b'R', b'0', 0x0A];
        let mut body = vec![op::METHOD];
        body.push((inner.len() + 1) as u8);
        body.extend_from_slice(&inner);

        let ns = parse(&body);
        match get_node(&ns, "\\SER0") {
            Node::Method(method) => {
                assert_eq!(method.arg_count, 2);
                assert!(method.serialized);
                assert!(method.mutex.is_some());
            }
            other => panic!("expected method, got {}", other.type_name()),
        }
    }
}
