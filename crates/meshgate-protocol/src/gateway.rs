//! Coordinator message layouts.
//!
//! Data layouts of the gateway-local functions used during enumeration. Each
//! type parses the reply record and can build it again, which the coordinator
//! simulators in the test suites rely on.
//!
//! | Function | Address | Reply data |
//! |----------|---------|------------|
//! | `GET_VERSION` | gateway | `[library][major][minor][controller id]` |
//! | `GET_INIT_DATA` | gateway | `[api version][capabilities][bitmap len][bitmap...]` |
//! | `GET_NODE_PROTOCOL_INFO` | unit | `[flags][security][reserved][basic][generic][specific]` |
//! | `REQUEST_NODE_INFO` | unit | `APPLICATION_UPDATE`: `[basic][generic][specific][classes...][0xF1][secure classes...]` |

use crate::constants::*;
use crate::error::MessageError;
use crate::frame::Frame;

fn expect_function(frame: &Frame, function: FunctionId) -> Result<(), MessageError> {
    if frame.function != function {
        return Err(MessageError::UnexpectedFunction {
            expected: function,
            actual: frame.function,
        });
    }
    Ok(())
}

fn expect_len(message: &'static str, data: &[u8], needed: usize) -> Result<(), MessageError> {
    if data.len() < needed {
        return Err(MessageError::TooShort {
            message,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Version
// ============================================================================

/// Coordinator firmware identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Library type code.
    pub library: u8,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Unit id of the coordinator itself.
    pub controller_id: u8,
}

impl VersionInfo {
    /// Parse a `GET_VERSION` reply.
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        expect_function(frame, FunctionId::GetVersion)?;
        expect_len("GET_VERSION", &frame.data, 4)?;
        Ok(VersionInfo {
            library: frame.data[0],
            major: frame.data[1],
            minor: frame.data[2],
            controller_id: frame.data[3],
        })
    }

    /// Reply data bytes.
    pub fn to_data(&self) -> Vec<u8> {
        vec![self.library, self.major, self.minor, self.controller_id]
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "library {} v{}.{} (controller {})",
            self.library, self.major, self.minor, self.controller_id
        )
    }
}

// ============================================================================
// Init Data
// ============================================================================

/// The coordinator's unit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    /// Serial API version.
    pub api_version: u8,
    /// Capability flags.
    pub capabilities: u8,
    /// Unit ids present in the network, ascending.
    pub units: Vec<u8>,
}

impl InitData {
    /// Parse a `GET_INIT_DATA` reply.
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        expect_function(frame, FunctionId::GetInitData)?;
        expect_len("GET_INIT_DATA", &frame.data, 3)?;
        let bitmap_len = (frame.data[2] as usize).min(NODE_BITMAP_LEN);
        expect_len("GET_INIT_DATA", &frame.data, 3 + bitmap_len)?;

        let bitmap = &frame.data[3..3 + bitmap_len];
        let units = bitmap
            .iter()
            .enumerate()
            .flat_map(|(byte, bits)| {
                (0..8u8)
                    .filter(move |bit| bits & (1 << bit) != 0)
                    .map(move |bit| (byte * 8) as u8 + bit + 1)
            })
            .filter(|id| *id <= MAX_UNIT_ID)
            .collect();

        Ok(InitData {
            api_version: frame.data[0],
            capabilities: frame.data[1],
            units,
        })
    }

    /// Reply data bytes.
    pub fn to_data(&self) -> Vec<u8> {
        let mut bitmap = [0u8; NODE_BITMAP_LEN];
        for id in self.units.iter().filter(|id| (1..=MAX_UNIT_ID).contains(*id)) {
            let index = (*id - 1) as usize;
            bitmap[index / 8] |= 1 << (index % 8);
        }
        let mut data = vec![self.api_version, self.capabilities, NODE_BITMAP_LEN as u8];
        data.extend_from_slice(&bitmap);
        data
    }
}

// ============================================================================
// Protocol Info
// ============================================================================

/// Device type codes the coordinator holds for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Always-listening (mains powered) unit.
    pub listening: bool,
    /// Basic device class.
    pub basic: u8,
    /// Generic device class; 0 means the unit is unknown to the coordinator.
    pub generic: u8,
    /// Specific device class.
    pub specific: u8,
}

impl ProtocolInfo {
    /// Parse a `GET_NODE_PROTOCOL_INFO` reply.
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        expect_function(frame, FunctionId::GetNodeProtocolInfo)?;
        expect_len("GET_NODE_PROTOCOL_INFO", &frame.data, 6)?;
        Ok(ProtocolInfo {
            listening: frame.data[0] & NODE_FLAG_LISTENING != 0,
            basic: frame.data[3],
            generic: frame.data[4],
            specific: frame.data[5],
        })
    }

    /// Whether the coordinator actually knows the unit.
    pub fn is_present(&self) -> bool {
        self.generic != 0
    }

    /// Reply data bytes.
    pub fn to_data(&self) -> Vec<u8> {
        let flags = if self.listening { NODE_FLAG_LISTENING } else { 0 };
        vec![flags, 0, 0, self.basic, self.generic, self.specific]
    }
}

// ============================================================================
// Node Info
// ============================================================================

/// Node information frame: the classes a unit supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Basic device class.
    pub basic: u8,
    /// Generic device class.
    pub generic: u8,
    /// Specific device class.
    pub specific: u8,
    /// Classes usable without encapsulation.
    pub classes: Vec<u8>,
    /// Classes that must be encapsulated.
    pub secure_classes: Vec<u8>,
}

impl NodeInfo {
    /// Parse an `APPLICATION_UPDATE` record.
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        expect_function(frame, FunctionId::ApplicationUpdate)?;
        expect_len("APPLICATION_UPDATE", &frame.data, 3)?;
        let list = &frame.data[3..];
        let (classes, secure_classes) = match list.iter().position(|b| *b == SECURE_CLASS_MARK) {
            Some(mark) => (list[..mark].to_vec(), list[mark + 1..].to_vec()),
            None => (list.to_vec(), Vec::new()),
        };
        Ok(NodeInfo {
            basic: frame.data[0],
            generic: frame.data[1],
            specific: frame.data[2],
            classes,
            secure_classes,
        })
    }

    /// Record data bytes.
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = vec![self.basic, self.generic, self.specific];
        data.extend_from_slice(&self.classes);
        if !self.secure_classes.is_empty() {
            data.push(SECURE_CLASS_MARK);
            data.extend_from_slice(&self.secure_classes);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_data_bitmap() {
        let init = InitData {
            api_version: 5,
            capabilities: 0x08,
            units: vec![1, 2, 5, 9, 232],
        };
        let data = init.to_data();
        assert_eq!(data.len(), 3 + NODE_BITMAP_LEN);
        assert_eq!(data[3], 0b0001_0011);
        assert_eq!(data[4], 0b0000_0001);

        let frame = Frame::new(GATEWAY_ADDRESS, FunctionId::GetInitData, data);
        let parsed = InitData::parse(&frame).expect("should parse");
        assert_eq!(parsed.units, vec![1, 2, 5, 9, 232]);
    }

    #[test]
    fn test_init_data_short() {
        let frame = Frame::new(GATEWAY_ADDRESS, FunctionId::GetInitData, vec![5, 0, 29, 0xFF]);
        assert!(matches!(
            InitData::parse(&frame),
            Err(MessageError::TooShort { .. })
        ));
    }

    #[test]
    fn test_wrong_function() {
        let frame = Frame::new(GATEWAY_ADDRESS, FunctionId::GetVersion, vec![0; 6]);
        assert!(matches!(
            ProtocolInfo::parse(&frame),
            Err(MessageError::UnexpectedFunction { .. })
        ));
    }

    #[test]
    fn test_protocol_info() {
        let frame = Frame::new(5, FunctionId::GetNodeProtocolInfo, vec![0x80, 0, 0, 4, 0x10, 0x01]);
        let info = ProtocolInfo::parse(&frame).expect("should parse");
        assert!(info.listening);
        assert_eq!((info.generic, info.specific), (0x10, 0x01));
        assert!(info.is_present());
    }

    #[test]
    fn test_node_info_secure_split() {
        let frame = Frame::new(
            5,
            FunctionId::ApplicationUpdate,
            vec![4, 0x10, 0x01, 0x25, 0x85, SECURE_CLASS_MARK, 0x70],
        );
        let info = NodeInfo::parse(&frame).expect("should parse");
        assert_eq!(info.classes, vec![0x25, 0x85]);
        assert_eq!(info.secure_classes, vec![0x70]);
        assert_eq!(info.to_data(), frame.data);
    }
}
