//! Register catalog: typed register descriptors loaded from the register file.
//!
//! The register file is JSON5 (plain JSON loads unchanged):
//!
//! ```text
//! {
//!   word_order: "big",
//!   connections: [ { type: "rtu", unit: 10, address: "/dev/ttyUSB0", baudrate: 9600, mode: "slave" } ],
//!   registers: [
//!     { name: "temperature", address: 10, kind: "holding", length: 2, type: "float" },
//!     { name: "relay", address: 0, kind: "coil" },
//!   ],
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::CatalogError;
use crate::settings::ConnectionSettings;

/// Maximum number of 16-bit registers read in one request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Maximum number of coils/discrete inputs read in one request.
pub const MAX_BITS_PER_READ: u16 = 2000;

/// Word order used when the register file does not name one.
///
/// Most significant word first, the common Modbus convention.
pub const DEFAULT_WORD_ORDER: WordOrder = WordOrder::Big;

/// Modbus register kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterKind {
    /// All kinds, in catalog order.
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::Coil,
        RegisterKind::Discrete,
        RegisterKind::Input,
        RegisterKind::Holding,
    ];

    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        }
    }

    /// Whether values of this kind are single bits.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }

    /// Whether external masters and the bridge may write this kind.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Holding)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegisterKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coil" | "coils" => Ok(RegisterKind::Coil),
            "discrete" | "discrete_input" | "discrete_inputs" | "ists" => {
                Ok(RegisterKind::Discrete)
            }
            "input" | "input_register" | "input_registers" | "iregs" => Ok(RegisterKind::Input),
            "holding" | "holding_register" | "holding_registers" | "hregs" => {
                Ok(RegisterKind::Holding)
            }
            _ => Err(CatalogError::UnknownKind(s.to_string())),
        }
    }
}

/// Value interpretation of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Single bit (coils and discrete inputs)
    Bit,
    /// Unsigned integer over 1, 2 or 4 registers
    #[serde(rename = "uint")]
    Unsigned,
    /// Two's complement integer over 1, 2 or 4 registers
    #[serde(rename = "int")]
    Signed,
    /// IEEE 754 float over 2 (f32) or 4 (f64) registers
    Float,
}

impl DataType {
    /// Return the string name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bit => "bit",
            DataType::Unsigned => "uint",
            DataType::Signed => "int",
            DataType::Float => "float",
        }
    }

    fn valid_length(&self, length: u16) -> bool {
        match self {
            DataType::Bit => length == 1,
            DataType::Unsigned | DataType::Signed => matches!(length, 1 | 2 | 4),
            DataType::Float => matches!(length, 2 | 4),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bit" | "bool" => Ok(DataType::Bit),
            "uint" | "unsigned" => Ok(DataType::Unsigned),
            "int" | "signed" => Ok(DataType::Signed),
            "float" => Ok(DataType::Float),
            _ => Err(CatalogError::UnknownType(s.to_string())),
        }
    }
}

/// Order of 16-bit words in multi-register values.
///
/// Bytes inside a word are always big-endian, as on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    /// Most significant word at the lowest address.
    #[default]
    #[serde(alias = "be")]
    Big,
    /// Least significant word at the lowest address.
    #[serde(alias = "le")]
    Little,
}

/// Identity of a register element: its kind and start address.
///
/// Serializes as its display form (`holding@10`) so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterKey {
    pub kind: RegisterKind,
    pub address: u16,
}

impl RegisterKey {
    pub fn new(kind: RegisterKind, address: u16) -> Self {
        Self { kind, address }
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.address)
    }
}

impl Serialize for RegisterKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One addressable Modbus element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterDescriptor {
    pub kind: RegisterKind,
    pub address: u16,
    /// Number of registers (words) or bits covered.
    pub length: u16,
    pub data_type: DataType,
    pub name: Option<String>,
}

impl RegisterDescriptor {
    pub fn key(&self) -> RegisterKey {
        RegisterKey::new(self.kind, self.address)
    }

    /// First address after this descriptor.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length)
    }

    /// Whether `address` falls inside this descriptor's range.
    pub fn covers(&self, address: u16) -> bool {
        address >= self.address && u32::from(address) < self.end()
    }

    /// Symbolic name, falling back to the key.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.key().to_string(),
        }
    }
}

/// A contiguous run of descriptors of one kind, read with a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock<'a> {
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
    pub descriptors: Vec<&'a RegisterDescriptor>,
}

/// Register definitions grouped by kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterCatalog {
    word_order: WordOrder,
    registers: BTreeMap<RegisterKind, Vec<RegisterDescriptor>>,
    connections: Vec<ConnectionSettings>,
}

#[derive(Debug, Deserialize)]
struct RegisterFile {
    #[serde(default)]
    word_order: WordOrder,
    #[serde(default)]
    connections: Vec<serde_json::Value>,
    #[serde(default)]
    registers: Vec<RawRegister>,
}

#[derive(Debug, Deserialize)]
struct RawRegister {
    name: Option<String>,
    address: u16,
    kind: String,
    #[serde(default = "default_length")]
    length: u16,
    #[serde(rename = "type")]
    data_type: Option<String>,
}

fn default_length() -> u16 {
    1
}

impl RegisterCatalog {
    /// Load and validate a register file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CatalogError::NotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate register definitions from a string.
    pub fn parse(content: &str) -> Result<Self, CatalogError> {
        let file: RegisterFile = json5::from_str(content)?;

        let mut registers: BTreeMap<RegisterKind, Vec<RegisterDescriptor>> = BTreeMap::new();
        for raw in file.registers {
            let descriptor = raw.into_descriptor()?;
            registers.entry(descriptor.kind).or_default().push(descriptor);
        }

        for descriptors in registers.values_mut() {
            descriptors.sort_by_key(|d| d.address);
            validate_layout(descriptors)?;
        }

        let connections = file
            .connections
            .into_iter()
            .map(ConnectionSettings::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            word_order: file.word_order,
            registers,
            connections,
        })
    }

    /// Word order applied to multi-register values.
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Connection settings declared in the register file.
    pub fn connections(&self) -> &[ConnectionSettings] {
        &self.connections
    }

    /// Descriptors of one kind, ordered by address.
    pub fn descriptors(&self, kind: RegisterKind) -> &[RegisterDescriptor] {
        self.registers.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All descriptors, grouped by kind and ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.values().flatten()
    }

    pub fn get(&self, key: RegisterKey) -> Option<&RegisterDescriptor> {
        let descriptors = self.descriptors(key.kind);
        descriptors
            .binary_search_by_key(&key.address, |d| d.address)
            .ok()
            .map(|idx| &descriptors[idx])
    }

    /// Descriptor whose range covers `address`.
    pub fn find_covering(&self, kind: RegisterKind, address: u16) -> Option<&RegisterDescriptor> {
        let descriptors = self.descriptors(kind);
        let idx = descriptors.partition_point(|d| d.address <= address);
        if idx == 0 {
            return None;
        }
        let candidate = &descriptors[idx - 1];
        candidate.covers(address).then_some(candidate)
    }

    pub fn len(&self) -> usize {
        self.registers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cluster descriptors into contiguous blocks for bulk reads.
    ///
    /// Gaps are never bridged, so a block only reads defined registers.
    pub fn blocks(&self) -> Vec<RegisterBlock<'_>> {
        let mut blocks = Vec::new();

        for (kind, descriptors) in &self.registers {
            let max = if kind.is_bit() {
                MAX_BITS_PER_READ
            } else {
                MAX_REGISTERS_PER_READ
            };

            let mut current: Option<RegisterBlock<'_>> = None;
            for descriptor in descriptors {
                match current.as_mut() {
                    Some(block)
                        if u32::from(block.address) + u32::from(block.count)
                            == u32::from(descriptor.address)
                            && block.count + descriptor.length <= max =>
                    {
                        block.count += descriptor.length;
                        block.descriptors.push(descriptor);
                    }
                    _ => {
                        if let Some(block) = current.take() {
                            blocks.push(block);
                        }
                        current = Some(RegisterBlock {
                            kind: *kind,
                            address: descriptor.address,
                            count: descriptor.length,
                            descriptors: vec![descriptor],
                        });
                    }
                }
            }
            if let Some(block) = current {
                blocks.push(block);
            }
        }

        blocks
    }
}

impl RawRegister {
    fn into_descriptor(self) -> Result<RegisterDescriptor, CatalogError> {
        let kind: RegisterKind = self.kind.parse()?;
        let key = RegisterKey::new(kind, self.address);

        let data_type = match self.data_type {
            Some(label) => label.parse()?,
            None if kind.is_bit() => DataType::Bit,
            None => DataType::Unsigned,
        };

        // Bit kinds hold exactly one bit per descriptor, word kinds never hold bits.
        if kind.is_bit() != (data_type == DataType::Bit) || !data_type.valid_length(self.length) {
            return Err(CatalogError::InvalidLength {
                key,
                data_type,
                length: self.length,
            });
        }

        if u32::from(self.address) + u32::from(self.length) > u32::from(u16::MAX) + 1 {
            return Err(CatalogError::AddressOverflow(key));
        }

        Ok(RegisterDescriptor {
            kind,
            address: self.address,
            length: self.length,
            data_type,
            name: self.name,
        })
    }
}

fn validate_layout(descriptors: &[RegisterDescriptor]) -> Result<(), CatalogError> {
    for pair in descriptors.windows(2) {
        let (first, second) = (&pair[0], &pair[1]);
        if first.address == second.address {
            return Err(CatalogError::DuplicateAddress(second.key()));
        }
        if first.end() > u32::from(second.address) {
            return Err(CatalogError::Overlap {
                first: first.key(),
                second: second.key(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTERS: &str = r#"{
        registers: [
            { name: "voltage", address: 2, kind: "holding", length: 2, type: "float" },
            { name: "setpoint", address: 0, kind: "HREGS" },
            { name: "counter", address: 4, kind: "holding", length: 4, type: "uint" },
            { name: "relay", address: 0, kind: "coils" },
            { name: "door", address: 7, kind: "discrete_input" },
            { name: "temperature", address: 100, kind: "input", type: "int" },
        ]
    }"#;

    #[test]
    fn test_parse_groups_and_sorts_by_kind() {
        let catalog = RegisterCatalog::parse(REGISTERS).unwrap();

        assert_eq!(catalog.len(), 6);
        assert_eq!(catalog.word_order(), WordOrder::Big);

        let holding: Vec<u16> = catalog
            .descriptors(RegisterKind::Holding)
            .iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(holding, vec![0, 2, 4]);

        let relay = catalog
            .get(RegisterKey::new(RegisterKind::Coil, 0))
            .unwrap();
        assert_eq!(relay.data_type, DataType::Bit);
        assert_eq!(relay.name.as_deref(), Some("relay"));

        let temperature = catalog
            .get(RegisterKey::new(RegisterKind::Input, 100))
            .unwrap();
        assert_eq!(temperature.data_type, DataType::Signed);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let first = RegisterCatalog::parse(REGISTERS).unwrap();
        let second = RegisterCatalog::parse(REGISTERS).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_kind() {
        let result = RegisterCatalog::parse(
            r#"{ registers: [ { address: 0, kind: "analog" } ] }"#,
        );
        assert!(matches!(result, Err(CatalogError::UnknownKind(kind)) if kind == "analog"));
    }

    #[test]
    fn test_unknown_type() {
        let result = RegisterCatalog::parse(
            r#"{ registers: [ { address: 0, kind: "holding", type: "string" } ] }"#,
        );
        assert!(matches!(result, Err(CatalogError::UnknownType(_))));
    }

    #[test]
    fn test_duplicate_address() {
        let result = RegisterCatalog::parse(
            r#"{ registers: [
                { address: 10, kind: "holding" },
                { address: 10, kind: "holding" },
            ] }"#,
        );
        assert!(matches!(
            result,
            Err(CatalogError::DuplicateAddress(key)) if key == RegisterKey::new(RegisterKind::Holding, 10)
        ));
    }

    #[test]
    fn test_same_address_in_different_kinds() {
        let catalog = RegisterCatalog::parse(
            r#"{ registers: [
                { address: 10, kind: "holding" },
                { address: 10, kind: "input" },
                { address: 10, kind: "coil" },
            ] }"#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_overlap() {
        let result = RegisterCatalog::parse(
            r#"{ registers: [
                { address: 10, kind: "holding", length: 2, type: "float" },
                { address: 11, kind: "holding" },
            ] }"#,
        );
        assert!(matches!(result, Err(CatalogError::Overlap { .. })));
    }

    #[test]
    fn test_invalid_lengths() {
        for registers in [
            r#"{ address: 0, kind: "holding", length: 3 }"#,
            r#"{ address: 0, kind: "holding", length: 1, type: "float" }"#,
            r#"{ address: 0, kind: "coil", length: 2 }"#,
            r#"{ address: 0, kind: "holding", type: "bit" }"#,
            r#"{ address: 0, kind: "discrete", type: "uint" }"#,
        ] {
            let content = format!("{{ registers: [ {} ] }}", registers);
            let result = RegisterCatalog::parse(&content);
            assert!(
                matches!(result, Err(CatalogError::InvalidLength { .. })),
                "expected InvalidLength for {}",
                registers
            );
        }
    }

    #[test]
    fn test_address_overflow() {
        let result = RegisterCatalog::parse(
            r#"{ registers: [ { address: 65535, kind: "holding", length: 2, type: "uint" } ] }"#,
        );
        assert!(matches!(result, Err(CatalogError::AddressOverflow(_))));
    }

    #[test]
    fn test_malformed_file() {
        let result = RegisterCatalog::parse("{ registers: [ ");
        assert!(matches!(result, Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = RegisterCatalog::load("/nonexistent/registers.json");
        assert!(matches!(result, Err(CatalogError::NotFound { .. })));
    }

    #[test]
    fn test_little_word_order() {
        let catalog = RegisterCatalog::parse(r#"{ word_order: "little", registers: [] }"#).unwrap();
        assert_eq!(catalog.word_order(), WordOrder::Little);
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_find_covering() {
        let catalog = RegisterCatalog::parse(REGISTERS).unwrap();

        let covering = catalog.find_covering(RegisterKind::Holding, 3).unwrap();
        assert_eq!(covering.address, 2);
        assert_eq!(
            catalog.find_covering(RegisterKind::Holding, 7).unwrap().address,
            4
        );
        assert!(catalog.find_covering(RegisterKind::Holding, 8).is_none());
        assert!(catalog.find_covering(RegisterKind::Input, 99).is_none());
    }

    #[test]
    fn test_blocks_cluster_contiguous_ranges() {
        let catalog = RegisterCatalog::parse(
            r#"{ registers: [
                { address: 0, kind: "holding" },
                { address: 1, kind: "holding", length: 2, type: "int" },
                { address: 10, kind: "holding" },
                { address: 0, kind: "coil" },
                { address: 1, kind: "coil" },
            ] }"#,
        )
        .unwrap();

        let blocks = catalog.blocks();
        assert_eq!(blocks.len(), 3);

        assert_eq!(blocks[0].kind, RegisterKind::Coil);
        assert_eq!((blocks[0].address, blocks[0].count), (0, 2));

        assert_eq!(blocks[1].kind, RegisterKind::Holding);
        assert_eq!((blocks[1].address, blocks[1].count), (0, 3));
        assert_eq!(blocks[1].descriptors.len(), 2);

        assert_eq!((blocks[2].address, blocks[2].count), (10, 1));
    }

    #[test]
    fn test_blocks_respect_request_limit() {
        let registers: Vec<String> = (0..130)
            .map(|address| format!(r#"{{ address: {}, kind: "input" }}"#, address))
            .collect();
        let content = format!("{{ registers: [ {} ] }}", registers.join(","));
        let catalog = RegisterCatalog::parse(&content).unwrap();

        let blocks = catalog.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].count, MAX_REGISTERS_PER_READ);
        assert_eq!(blocks[1].address, MAX_REGISTERS_PER_READ);
        assert_eq!(blocks[1].count, 5);
    }

    #[test]
    fn test_register_kind_as_str() {
        assert_eq!(RegisterKind::Coil.as_str(), "coil");
        assert_eq!(RegisterKind::Discrete.as_str(), "discrete");
        assert_eq!(RegisterKind::Input.as_str(), "input");
        assert_eq!(RegisterKind::Holding.as_str(), "holding");
        assert_eq!(
            RegisterKey::new(RegisterKind::Holding, 10).to_string(),
            "holding@10"
        );
    }
}
