//! The ACPI namespace.
//!
//! A tree keyed by 4-character segments, stored flat as a map from
//! absolute paths to refcounted nodes. Bare single-segment names
//! resolve by walking upward through enclosing scopes; multi-segment
//! names resolve relative to their scope directly.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};

use super::name::{AbsPath, NameSeg, NameString};
use super::node::{make_ref, AmlMutexState, Node, NodeRef};

pub struct Namespace {
    objects: BTreeMap<AbsPath, NodeRef>,
}

impl Namespace {
    /// A namespace with the predefined root scopes, the global-lock
    /// mutex, and the OS identity objects.
    pub fn new() -> Self {
        let mut ns = Namespace {
            objects: BTreeMap::new(),
        };

        for scope in ["_SB_", "_SI_", "_TZ_", "_PR_", "_GPE"] {
            ns.objects.insert(
                AbsPath::root().child(NameSeg::new(scope)),
                make_ref(Node::PredefinedScope),
            );
        }
        ns.objects.insert(
            AbsPath::root().child(NameSeg::new("_GL_")),
            make_ref(Node::Mutex(Arc::new(AmlMutexState::new(0)))),
        );
        ns.objects.insert(
            AbsPath::root().child(NameSeg::new("_OS_")),
            make_ref(Node::string("Ferrox")),
        );
        ns.objects.insert(
            AbsPath::root().child(NameSeg::new("_REV")),
            make_ref(Node::Integer(2)),
        );

        ns
    }

    pub fn get(&self, path: &AbsPath) -> Option<NodeRef> {
        self.objects.get(path).cloned()
    }

    /// Insert at an absolute path. Duplicate definitions are refused.
    pub fn insert_abs(&mut self, path: AbsPath, node_ref: NodeRef) -> Result<NodeRef> {
        if self.objects.contains_key(&path) {
            log::warn!("aml: duplicate definition of {}", path);
            return Err(KernelError::AlreadyExists);
        }
        self.objects.insert(path, node_ref.clone());
        Ok(node_ref)
    }

    /// Create `node` under `scope` at `name`.
    pub fn add(&mut self, scope: &AbsPath, name: &NameString, node: Node) -> Result<NodeRef> {
        let path = name.resolve_from(scope)?;
        self.insert_abs(path, make_ref(node))
    }

    /// Find an object. Bare single-segment names walk up through the
    /// enclosing scopes when `search_parents` is set; everything else
    /// resolves from `scope` directly.
    pub fn find(
        &self,
        scope: &AbsPath,
        name: &NameString,
        search_parents: bool,
    ) -> Option<(AbsPath, NodeRef)> {
        if name.is_bare_single_seg() && search_parents {
            let seg = name.segs[0];
            let mut current = Some(scope.clone());
            while let Some(base) = current {
                let candidate = base.child(seg);
                if let Some(node) = self.objects.get(&candidate) {
                    return Some((candidate, node.clone()));
                }
                current = base.parent();
            }
            return None;
        }

        let path = name.resolve_from(scope).ok()?;
        self.objects.get(&path).map(|node| (path, node.clone()))
    }

    /// Visit every direct child of `scope`.
    pub fn for_each_child(&self, scope: &AbsPath, mut f: impl FnMut(&AbsPath, &NodeRef)) {
        for (path, node) in self.objects.range(scope.clone()..) {
            if path.segs.len() > scope.segs.len() + 1 {
                continue;
            }
            if path == scope {
                continue;
            }
            if !scope.is_parent_of(path) {
                if path.segs.get(..scope.segs.len()) != Some(&scope.segs[..]) {
                    break;
                }
                continue;
            }
            f(path, node);
        }
    }

    /// Every `Device` whose `_HID` (or `_CID`) matches an EISA id such
    /// as `PNP0C09`, by either string or compressed-integer encoding.
    pub fn find_devices_with_eisa_id(&self, eisa: &str) -> Vec<AbsPath> {
        let mut result = Vec::new();
        for (path, node) in self.objects.iter() {
            if !matches!(&*node.lock(), Node::Device) {
                continue;
            }
            for id_name in ["_HID", "_CID"] {
                let id_path = path.child(NameSeg::new(id_name));
                let Some(id_node) = self.objects.get(&id_path) else {
                    continue;
                };
                let matches = match &*id_node.lock() {
                    Node::Integer(value) => eisa_id_to_string(*value as u32).as_deref() == Some(eisa),
                    Node::String(buffer) => buffer.lock().as_slice() == eisa.as_bytes(),
                    _ => false,
                };
                if matches {
                    result.push(path.clone());
                    break;
                }
            }
        }
        result
    }

    /// Post-load pass: evaluate `_STA` for every device and run `_INI`
    /// on the present ones. Failures are logged, never fatal.
    pub fn post_load_initialize(&mut self) {
        let device_paths: Vec<AbsPath> = self
            .objects
            .iter()
            .filter(|(_, node)| matches!(&*node.lock(), Node::Device))
            .map(|(path, _)| path.clone())
            .collect();

        for path in device_paths {
            let sta = match self.get(&path.child(NameSeg::new("_STA"))) {
                Some(node_ref) => {
                    match super::parser::evaluate_node(self, &path, &node_ref)
                        .and_then(|node| {
                            super::convert::convert_node(self, node, super::convert::CONV_INTEGER, 8)
                        }) {
                        Ok(node) => node.as_integer().unwrap_or(0x0F),
                        Err(err) => {
                            log::warn!("aml: _STA for {} failed: {}", path, err);
                            continue;
                        }
                    }
                }
                // No _STA means present and functioning.
                None => 0x0F,
            };

            if sta & 0x01 == 0 {
                continue;
            }

            if let Some(ini_ref) = self.get(&path.child(NameSeg::new("_INI"))) {
                if let Err(err) = super::parser::evaluate_node(self, &path, &ini_ref) {
                    log::warn!("aml: _INI for {} failed: {}", path, err);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a compressed EISA id (as stored in integer `_HID`s) into its
/// 7-character form. The dword is stored big-endian.
pub fn eisa_id_to_string(id: u32) -> Option<String> {
    let id = id.swap_bytes();

    let letter = |v: u32| -> Option<char> {
        let c = (v & 0x1F) as u8 + 0x40;
        c.is_ascii_uppercase().then(|| c as char)
    };

    let mut out = String::with_capacity(7);
    out.push(letter(id >> 26)?);
    out.push(letter(id >> 21)?);
    out.push(letter(id >> 16)?);
    for shift in [12u32, 8, 4, 0] {
        let digit = (id >> shift) & 0xF;
        out.push(char::from_digit(digit, 16)?.to_ascii_uppercase());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_scopes() {
        let ns = Namespace::new();
        let sb = NameString::from_str("\\_SB_").unwrap();
        assert!(ns.find(&AbsPath::root(), &sb, false).is_some());
        let gl = NameString::from_str("\\_GL_").unwrap();
        let (_, node) = ns.find(&AbsPath::root(), &gl, false).unwrap();
        assert!(matches!(&*node.lock(), Node::Mutex(_)));
    }

    #[test]
    fn test_single_seg_walks_up() {
        let mut ns = Namespace::new();
        let sb = AbsPath::root().child(NameSeg::new("_SB_"));
        let dev = sb.child(NameSeg::new("DEV0"));
        ns.insert_abs(dev.clone(), make_ref(Node::Device)).unwrap();
        ns.add(&sb, &NameString::from_str("VAL_").unwrap(), Node::Integer(7))
            .unwrap();

        // From inside DEV0, a bare VAL_ finds \_SB_.VAL_.
        let name = NameString::from_str("VAL_").unwrap();
        let (path, node) = ns.find(&dev, &name, true).expect("found by walking up");
        assert_eq!(path.segs.len(), 2);
        assert_eq!(node.lock().as_integer(), Some(7));

        // Without parent search it misses.
        assert!(ns.find(&dev, &name, false).is_none());
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut ns = Namespace::new();
        let name = NameString::from_str("\\FOO_").unwrap();
        ns.add(&AbsPath::root(), &name, Node::Integer(1)).unwrap();
        assert!(matches!(
            ns.add(&AbsPath::root(), &name, Node::Integer(2)),
            Err(KernelError::AlreadyExists)
        ));
    }

    #[test]
    fn test_eisa_decoding() {
        // "PNP0C09" encodes to 0x090CD041 (little-endian dword).
        assert_eq!(eisa_id_to_string(0x090CD041).as_deref(), Some("PNP0C09"));
        // "PNP0C0F" — interrupt link device.
        assert_eq!(eisa_id_to_string(0x0F0CD041).as_deref(), Some("PNP0C0F"));
    }

    #[test]
    fn test_find_devices_by_eisa() {
        let mut ns = Namespace::new();
        let sb = AbsPath::root().child(NameSeg::new("_SB_"));
        let ec = sb.child(NameSeg::new("EC0_"));
        ns.insert_abs(ec.clone(), make_ref(Node::Device)).unwrap();
        ns.insert_abs(
            ec.child(NameSeg::new("_HID")),
            make_ref(Node::Integer(0x090CD041)),
        )
        .unwrap();

        let found = ns.find_devices_with_eisa_id("PNP0C09");
        assert_eq!(found, vec![ec]);
        assert!(ns.find_devices_with_eisa_id("PNP0A03").is_empty());
    }

    #[test]
    fn test_for_each_child_direct_only() {
        let mut ns = Namespace::new();
        let sb = AbsPath::root().child(NameSeg::new("_SB_"));
        let dev = sb.child(NameSeg::new("DEV0"));
        ns.insert_abs(dev.clone(), make_ref(Node::Device)).unwrap();
        ns.insert_abs(dev.child(NameSeg::new("_HID")), make_ref(Node::Integer(1)))
            .unwrap();

        let mut children = Vec::new();
        ns.for_each_child(&sb, |path, _| children.push(path.clone()));
        assert_eq!(children, vec![dev], "Grandchildren are not direct children");
    }
}
