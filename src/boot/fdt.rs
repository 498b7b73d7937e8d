//! Flattened device-tree trimming and patching for ARM guests.
//!
//! The host's tree is parsed into an owned node tree, pruned down to
//! the nodes the guest is allowed to see, patched, and re-emitted as a
//! flat blob. Keeping works by closure: the keep list seeds the set,
//! phandle references are chased through the dependency-carrying
//! properties (`phy-handle`, `next-level-cache`, `interrupt-parent`,
//! `interrupts-extended`, `clocks` decoding `#clock-cells`,
//! `power-domains`), every ancestor of a kept node survives, and
//! everything else is deleted. Nodes on the kept-but-disabled list
//! additionally get `status = "disabled"`.
//!
//! [`generate_vpci_node`] emits the `pci` node for the virtual PCI
//! space: `reg` and `ranges` in the root's address/size cells, and an
//! `interrupt-map` entry per device with the GIC's interrupt cells.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::pci::VpciConfig;

use super::{BootError, Result};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

/// Properties whose values reference other nodes by phandle.
const DEP_PROPS: [&str; 6] = [
    "phy-handle",
    "next-level-cache",
    "interrupt-parent",
    "interrupts-extended",
    "clocks",
    "power-domains",
];

const PCI_RANGE_IO: u32 = 1;
const PCI_RANGE_MEM32: u32 = 2;

#[derive(Debug, Clone)]
pub struct FdtProp {
    pub name: String,
    pub data: Vec<u8>,
}

impl FdtProp {
    fn u32_at(&self, index: usize) -> Option<u32> {
        let at = index * 4;
        self.data
            .get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FdtNode {
    pub name: String,
    pub props: Vec<FdtProp>,
    pub children: Vec<FdtNode>,
}

impl FdtNode {
    pub fn prop(&self, name: &str) -> Option<&FdtProp> {
        self.props.iter().find(|p| p.name == name)
    }

    pub fn set_prop(&mut self, name: &str, data: Vec<u8>) {
        match self.props.iter_mut().find(|p| p.name == name) {
            Some(prop) => prop.data = data,
            None => self.props.push(FdtProp {
                name: name.to_string(),
                data,
            }),
        }
    }

    fn phandle(&self) -> Option<u32> {
        self.prop("phandle")
            .or_else(|| self.prop("linux,phandle"))
            .and_then(|p| p.u32_at(0))
    }
}

/// A parsed device tree: the root node plus the pieces of the blob that
/// survive re-emission verbatim.
pub struct DeviceTree {
    pub root: FdtNode,
    reserved: Vec<(u64, u64)>,
    boot_cpuid: u32,
}

struct Parser<'a> {
    struct_block: &'a [u8],
    strings: &'a [u8],
    at: usize,
}

impl<'a> Parser<'a> {
    fn token(&mut self) -> Result<u32> {
        let bytes = self
            .struct_block
            .get(self.at..self.at + 4)
            .ok_or(BootError::BadDeviceTree("truncated structure block"))?;
        self.at += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn cstr(&mut self) -> Result<String> {
        let start = self.at;
        let tail = self
            .struct_block
            .get(start..)
            .ok_or(BootError::BadDeviceTree("truncated structure block"))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(BootError::BadDeviceTree("unterminated name"))?;
        let name = String::from_utf8_lossy(&tail[..end]).into_owned();
        self.at = (start + end + 1 + 3) & !3;
        Ok(name)
    }

    fn string_at(&self, offset: usize) -> Result<String> {
        let tail = self
            .strings
            .get(offset..)
            .ok_or(BootError::BadDeviceTree("string offset out of bounds"))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(BootError::BadDeviceTree("unterminated string"))?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    fn node(&mut self, name: String) -> Result<FdtNode> {
        let mut node = FdtNode {
            name,
            ..FdtNode::default()
        };
        loop {
            match self.token()? {
                FDT_PROP => {
                    let len = self.token()? as usize;
                    let nameoff = self.token()? as usize;
                    let data = self
                        .struct_block
                        .get(self.at..self.at + len)
                        .ok_or(BootError::BadDeviceTree("truncated property"))?
                        .to_vec();
                    self.at = (self.at + len + 3) & !3;
                    node.props.push(FdtProp {
                        name: self.string_at(nameoff)?,
                        data,
                    });
                }
                FDT_BEGIN_NODE => {
                    let child_name = self.cstr()?;
                    node.children.push(self.node(child_name)?);
                }
                FDT_END_NODE => return Ok(node),
                FDT_NOP => {}
                _ => return Err(BootError::BadDeviceTree("unexpected token")),
            }
        }
    }
}

impl DeviceTree {
    pub fn parse(blob: &[u8]) -> Result<DeviceTree> {
        if blob.len() < 40 {
            return Err(BootError::BadDeviceTree("blob shorter than the header"));
        }
        let be32 = |at: usize| u32::from_be_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]]);
        if be32(0) != FDT_MAGIC {
            return Err(BootError::BadDeviceTree("bad magic"));
        }
        let totalsize = be32(4) as usize;
        if totalsize > blob.len() {
            return Err(BootError::BadDeviceTree("totalsize beyond the buffer"));
        }
        let off_struct = be32(8) as usize;
        let off_strings = be32(12) as usize;
        let off_rsvmap = be32(16) as usize;
        let boot_cpuid = be32(28);
        let size_strings = be32(32) as usize;
        let size_struct = be32(36) as usize;

        let mut reserved = Vec::new();
        let mut at = off_rsvmap;
        loop {
            if at + 16 > blob.len() {
                return Err(BootError::BadDeviceTree("truncated reservation map"));
            }
            let addr = u64::from_be_bytes([
                blob[at],
                blob[at + 1],
                blob[at + 2],
                blob[at + 3],
                blob[at + 4],
                blob[at + 5],
                blob[at + 6],
                blob[at + 7],
            ]);
            let size = u64::from_be_bytes([
                blob[at + 8],
                blob[at + 9],
                blob[at + 10],
                blob[at + 11],
                blob[at + 12],
                blob[at + 13],
                blob[at + 14],
                blob[at + 15],
            ]);
            if addr == 0 && size == 0 {
                break;
            }
            reserved.push((addr, size));
            at += 16;
        }

        let mut parser = Parser {
            struct_block: blob
                .get(off_struct..off_struct + size_struct)
                .ok_or(BootError::BadDeviceTree("structure block out of bounds"))?,
            strings: blob
                .get(off_strings..off_strings + size_strings)
                .ok_or(BootError::BadDeviceTree("strings block out of bounds"))?,
            at: 0,
        };
        if parser.token()? != FDT_BEGIN_NODE {
            return Err(BootError::BadDeviceTree("missing root node"));
        }
        let root_name = parser.cstr()?;
        let root = parser.node(root_name)?;
        Ok(DeviceTree {
            root,
            reserved,
            boot_cpuid,
        })
    }

    /// Serialise back to a flat blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut strings: Vec<u8> = Vec::new();
        let mut string_offsets: HashMap<String, u32> = HashMap::new();
        let mut structure: Vec<u8> = Vec::new();

        fn emit(
            node: &FdtNode,
            structure: &mut Vec<u8>,
            strings: &mut Vec<u8>,
            string_offsets: &mut HashMap<String, u32>,
        ) {
            structure.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
            structure.extend_from_slice(node.name.as_bytes());
            structure.push(0);
            while structure.len() % 4 != 0 {
                structure.push(0);
            }
            for prop in &node.props {
                let nameoff = *string_offsets.entry(prop.name.clone()).or_insert_with(|| {
                    let off = strings.len() as u32;
                    strings.extend_from_slice(prop.name.as_bytes());
                    strings.push(0);
                    off
                });
                structure.extend_from_slice(&FDT_PROP.to_be_bytes());
                structure.extend_from_slice(&(prop.data.len() as u32).to_be_bytes());
                structure.extend_from_slice(&nameoff.to_be_bytes());
                structure.extend_from_slice(&prop.data);
                while structure.len() % 4 != 0 {
                    structure.push(0);
                }
            }
            for child in &node.children {
                emit(child, structure, strings, string_offsets);
            }
            structure.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        }
        emit(&self.root, &mut structure, &mut strings, &mut string_offsets);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let rsvmap_len = (self.reserved.len() + 1) * 16;
        let off_rsvmap = 40usize;
        let off_struct = off_rsvmap + rsvmap_len;
        let off_strings = off_struct + structure.len();
        let totalsize = off_strings + strings.len();

        let mut blob = Vec::with_capacity(totalsize);
        for value in [
            FDT_MAGIC,
            totalsize as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            17, // version
            16, // last compatible version
            self.boot_cpuid,
            strings.len() as u32,
            structure.len() as u32,
        ] {
            blob.extend_from_slice(&value.to_be_bytes());
        }
        for &(addr, size) in &self.reserved {
            blob.extend_from_slice(&addr.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&structure);
        blob.extend_from_slice(&strings);
        blob
    }

    fn for_each_path(node: &FdtNode, prefix: &str, f: &mut impl FnMut(&str, &FdtNode)) {
        let path = if prefix.is_empty() {
            "/".to_string()
        } else if prefix == "/" {
            format!("/{}", node.name)
        } else {
            format!("{prefix}/{}", node.name)
        };
        f(&path, node);
        for child in &node.children {
            Self::for_each_path(child, &path, f);
        }
    }

    /// Node lookup by absolute path.
    pub fn node(&self, path: &str) -> Option<&FdtNode> {
        if path == "/" {
            return Some(&self.root);
        }
        let mut node = &self.root;
        for part in path.trim_start_matches('/').split('/') {
            node = node.children.iter().find(|c| {
                c.name == part || c.name.split('@').next() == Some(part)
            })?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut FdtNode> {
        if path == "/" {
            return Some(&mut self.root);
        }
        let mut node = &mut self.root;
        for part in path.trim_start_matches('/').split('/') {
            node = node.children.iter_mut().find(|c| {
                c.name == part || c.name.split('@').next() == Some(part)
            })?;
        }
        Some(node)
    }

    fn phandle_index(&self) -> HashMap<u32, String> {
        let mut index = HashMap::new();
        Self::for_each_path(&self.root, "", &mut |path, node| {
            if let Some(phandle) = node.phandle() {
                index.insert(phandle, path.to_string());
            }
        });
        index
    }

    /// Phandles one dependency property refers to.
    fn referenced_phandles(&self, path: &str, prop: &FdtProp) -> Vec<u32> {
        let mut refs = Vec::new();
        match prop.name.as_str() {
            "clocks" | "interrupts-extended" => {
                // phandle followed by #clock-cells / #interrupt-cells
                // argument words of the referenced node.
                let cells_prop = if prop.name == "clocks" {
                    "#clock-cells"
                } else {
                    "#interrupt-cells"
                };
                let index = self.phandle_index();
                let mut at = 0;
                while let Some(phandle) = prop.u32_at(at) {
                    refs.push(phandle);
                    let cells = index
                        .get(&phandle)
                        .and_then(|p| self.node(p))
                        .and_then(|n| n.prop(cells_prop))
                        .and_then(|p| p.u32_at(0))
                        .unwrap_or(0);
                    at += 1 + cells as usize;
                }
            }
            "power-domains" => {
                // Conservatively treat every word as a phandle; words
                // that resolve to nothing are arguments.
                let mut at = 0;
                while let Some(phandle) = prop.u32_at(at) {
                    refs.push(phandle);
                    at += 1;
                }
            }
            _ => {
                if let Some(phandle) = prop.u32_at(0) {
                    refs.push(phandle);
                }
            }
        }
        let _ = path;
        refs
    }

    /// Resolve a possibly unit-address-less path to the node's real
    /// path.
    fn canonical_path(&self, path: &str) -> Option<String> {
        if path == "/" {
            return Some("/".to_string());
        }
        let mut node = &self.root;
        let mut canonical = String::new();
        for part in path.trim_start_matches('/').split('/') {
            node = node.children.iter().find(|c| {
                c.name == part || c.name.split('@').next() == Some(part)
            })?;
            canonical.push('/');
            canonical.push_str(&node.name);
        }
        Some(canonical)
    }

    /// Trim the tree down to `keep` (plus dependencies and ancestors).
    /// Nodes in `keep_disabled` survive with `status = "disabled"`.
    pub fn trim(&mut self, keep: &[&str], keep_disabled: &[&str]) -> Result<()> {
        let resolve = |paths: &[&str]| -> Result<Vec<String>> {
            paths
                .iter()
                .map(|p| {
                    self.canonical_path(p)
                        .ok_or_else(|| BootError::NodeNotFound(p.to_string()))
                })
                .collect()
        };
        let keep = resolve(keep)?;
        let keep_disabled = resolve(keep_disabled)?;

        let phandles = self.phandle_index();
        let mut kept: HashSet<String> = HashSet::new();
        let mut worklist: VecDeque<String> =
            keep.iter().chain(keep_disabled.iter()).cloned().collect();

        while let Some(path) = worklist.pop_front() {
            if !kept.insert(path.clone()) {
                continue;
            }
            // Ancestors stay.
            let mut prefix = path.as_str();
            while let Some(cut) = prefix.rfind('/') {
                prefix = &prefix[..cut];
                if !prefix.is_empty() {
                    kept.insert(prefix.to_string());
                }
            }
            // Chase phandle references.
            let Some(node) = self.node(&path) else { continue };
            let deps: Vec<u32> = node
                .props
                .iter()
                .filter(|p| DEP_PROPS.contains(&p.name.as_str()))
                .flat_map(|p| self.referenced_phandles(&path, p))
                .collect();
            for phandle in deps {
                if let Some(target) = phandles.get(&phandle) {
                    if !kept.contains(target) {
                        worklist.push_back(target.clone());
                    }
                }
            }
        }

        // A kept node keeps its whole subtree; ancestors keep only the
        // children leading to (or being) kept nodes.
        fn has_kept_below(path: &str, kept: &HashSet<String>) -> bool {
            let prefix = format!("{path}/");
            kept.iter().any(|k| k.starts_with(&prefix))
        }
        fn prune(node: &mut FdtNode, path: &str, kept: &HashSet<String>) {
            node.children.retain(|child| {
                let child_path = if path == "/" {
                    format!("/{}", child.name)
                } else {
                    format!("{path}/{}", child.name)
                };
                kept.contains(&child_path) || has_kept_below(&child_path, kept)
            });
            for child in &mut node.children {
                let child_path = if path == "/" {
                    format!("/{}", child.name)
                } else {
                    format!("{path}/{}", child.name)
                };
                if has_kept_below(&child_path, kept) {
                    prune(child, &child_path, kept);
                }
            }
        }
        prune(&mut self.root, "/", &kept);

        for path in &keep_disabled {
            if let Some(node) = self.node_mut(path) {
                let mut data = b"disabled".to_vec();
                data.push(0);
                node.set_prop("status", data);
            }
        }
        Ok(())
    }

    /// Emit the virtual-PCI host node. `devices` lists the populated
    /// slots as `(device number, interrupt pin, interrupt line)`.
    pub fn generate_vpci_node(
        &mut self,
        vpci: &VpciConfig,
        devices: &[(u8, u8, u32)],
        gic_phandle: u32,
        gic_address_cells: u32,
    ) -> Result<()> {
        let address_cells = self
            .root
            .prop("#address-cells")
            .and_then(|p| p.u32_at(0))
            .unwrap_or(2);
        let size_cells = self
            .root
            .prop("#size-cells")
            .and_then(|p| p.u32_at(0))
            .unwrap_or(2);

        let mut node = FdtNode {
            name: "pci".to_string(),
            ..FdtNode::default()
        };
        node.set_prop("#address-cells", be_cells(3, 1));
        node.set_prop("#size-cells", be_cells(2, 1));
        node.set_prop("#interrupt-cells", be_cells(1, 1));
        node.set_prop("compatible", c_string("pci-host-cam-generic"));
        node.set_prop("device_type", c_string("pci"));
        node.set_prop("dma-coherent", Vec::new());
        let mut bus_range = be_cells(0, 1);
        bus_range.extend(be_cells(1, 1));
        node.set_prop("bus-range", bus_range);

        let mut reg = be_cells(vpci.cfg_addr, address_cells);
        reg.extend(be_cells(vpci.cfg_size, size_cells));
        node.set_prop("reg", reg);

        // ranges: the IO window then the 32-bit memory window, each as
        // (pci address) (cpu address) (size).
        let mut ranges = Vec::new();
        ranges.extend(be_cells((PCI_RANGE_IO as u64) << 24, 1));
        ranges.extend(be_cells(0, 2));
        ranges.extend(be_cells(vpci.io_addr, address_cells));
        ranges.extend(be_cells(vpci.io_size, 2));
        ranges.extend(be_cells((PCI_RANGE_MEM32 as u64) << 24, 1));
        ranges.extend(be_cells(vpci.mem_addr, 2));
        ranges.extend(be_cells(vpci.mem_addr, address_cells));
        ranges.extend(be_cells(vpci.mem_size, 2));
        node.set_prop("ranges", ranges);

        if !devices.is_empty() {
            let mut map = Vec::new();
            for &(dev, pin, line) in devices {
                map.extend(be_cells((dev as u64) << 11, 1));
                map.extend(be_cells(0, 2));
                map.extend(be_cells(pin as u64, 1));
                map.extend(be_cells(gic_phandle as u64, 1));
                // GIC interrupt specifier: SPI type, number, level-high.
                map.extend(be_cells(0, gic_address_cells));
                map.extend(be_cells(line as u64 - 32, gic_address_cells));
                map.extend(be_cells(0x4, 1));
            }
            node.set_prop("interrupt-map", map);

            let mut mask = be_cells(0xf800, 1);
            mask.extend(be_cells(0, 2));
            mask.extend(be_cells(0x7, 1));
            node.set_prop("interrupt-map-mask", mask);
        }

        self.root.children.push(node);
        Ok(())
    }
}

fn be_cells(value: u64, cells: u32) -> Vec<u8> {
    match cells {
        1 => (value as u32).to_be_bytes().to_vec(),
        2 => value.to_be_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn c_string(s: &str) -> Vec<u8> {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop_u32(value: u32) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    /// Build a small host tree:
    /// /
    ///   cpus/cpu@0
    ///   soc/uart   (clocks = <&clk 1>, interrupt-parent = <&gic>)
    ///   soc/clk    (phandle 2, #clock-cells 1)
    ///   soc/dma
    ///   gic        (phandle 1)
    fn sample_tree() -> DeviceTree {
        let mut root = FdtNode {
            name: String::new(),
            ..FdtNode::default()
        };
        root.set_prop("#address-cells", prop_u32(2));
        root.set_prop("#size-cells", prop_u32(2));

        let mut cpus = FdtNode {
            name: "cpus".into(),
            ..FdtNode::default()
        };
        cpus.children.push(FdtNode {
            name: "cpu@0".into(),
            ..FdtNode::default()
        });

        let mut gic = FdtNode {
            name: "gic".into(),
            ..FdtNode::default()
        };
        gic.set_prop("phandle", prop_u32(1));
        gic.set_prop("#interrupt-cells", prop_u32(3));

        let mut clk = FdtNode {
            name: "clk".into(),
            ..FdtNode::default()
        };
        clk.set_prop("phandle", prop_u32(2));
        clk.set_prop("#clock-cells", prop_u32(1));

        let mut uart = FdtNode {
            name: "uart".into(),
            ..FdtNode::default()
        };
        let mut clocks = prop_u32(2);
        clocks.extend(prop_u32(1));
        uart.set_prop("clocks", clocks);
        uart.set_prop("interrupt-parent", prop_u32(1));

        let mut soc = FdtNode {
            name: "soc".into(),
            ..FdtNode::default()
        };
        soc.children.push(uart);
        soc.children.push(clk);
        soc.children.push(FdtNode {
            name: "dma".into(),
            ..FdtNode::default()
        });

        root.children.push(cpus);
        root.children.push(soc);
        root.children.push(gic);
        DeviceTree {
            root,
            reserved: vec![],
            boot_cpuid: 0,
        }
    }

    #[test]
    fn test_roundtrip_through_blob() {
        let tree = sample_tree();
        let blob = tree.to_blob();
        let parsed = DeviceTree::parse(&blob).unwrap();
        assert!(parsed.node("/soc/uart").is_some());
        assert!(parsed.node("/gic").is_some());
        let clk = parsed.node("/soc/clk").unwrap();
        assert_eq!(clk.prop("#clock-cells").unwrap().u32_at(0), Some(1));
    }

    #[test]
    fn test_trim_chases_references() {
        let mut tree = sample_tree();
        tree.trim(&["/soc/uart"], &[]).unwrap();
        // The uart's clock and interrupt parent survive the trim.
        assert!(tree.node("/soc/uart").is_some());
        assert!(tree.node("/soc/clk").is_some());
        assert!(tree.node("/gic").is_some());
        // Unreferenced siblings are gone.
        assert!(tree.node("/soc/dma").is_none());
        assert!(tree.node("/cpus").is_none());
    }

    #[test]
    fn test_trim_keeps_ancestors_and_subtrees() {
        let mut tree = sample_tree();
        tree.trim(&["/cpus"], &[]).unwrap();
        assert!(tree.node("/cpus").is_some());
        // Children of a kept node survive whole.
        assert!(tree.node("/cpus/cpu@0").is_some());
        assert!(tree.node("/soc").is_none());
    }

    #[test]
    fn test_trim_disables_kept_nodes() {
        let mut tree = sample_tree();
        tree.trim(&["/cpus"], &["/soc/dma"]).unwrap();
        let dma = tree.node("/soc/dma").unwrap();
        assert_eq!(dma.prop("status").unwrap().data, b"disabled\0");
    }

    #[test]
    fn test_trim_unknown_path_fails() {
        let mut tree = sample_tree();
        assert!(matches!(
            tree.trim(&["/does/not/exist"], &[]),
            Err(BootError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_vpci_node_generation() {
        let mut tree = sample_tree();
        let vpci = VpciConfig::default();
        tree.generate_vpci_node(&vpci, &[(1, 1, 42)], 1, 1).unwrap();
        let pci = tree.node("/pci").unwrap();
        assert_eq!(pci.prop("device_type").unwrap().data, b"pci\0");

        // reg = cfg_addr (2 cells) + cfg_size (2 cells).
        let reg = pci.prop("reg").unwrap();
        assert_eq!(reg.data.len(), 16);
        assert_eq!(
            u64::from_be_bytes(reg.data[0..8].try_into().unwrap()),
            vpci.cfg_addr
        );

        // interrupt-map: one entry, SPI number is line - 32.
        let map = pci.prop("interrupt-map").unwrap();
        let words: Vec<u32> = map
            .data
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words[0], 1 << 11);
        assert_eq!(words[3], 1); // pin
        assert_eq!(words[4], 1); // gic phandle
        assert_eq!(words[6], 10); // 42 - 32
        assert_eq!(words[7], 0x4); // level-high

        let mask = pci.prop("interrupt-map-mask").unwrap();
        assert_eq!(mask.data.len(), 16);
    }
}
