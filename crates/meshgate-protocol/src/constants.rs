//! Protocol constants
//!
//! Control bytes, record geometry and gateway function identifiers used on the
//! serial link between the host and the network coordinator.

// ============================================================================
// Control Bytes
// ============================================================================

/// Start-of-record marker.
pub const START: u8 = 0x01;
/// Link-level acknowledgement of a received record.
pub const ACK: u8 = 0x06;
/// Link-level rejection of a received record (bad checksum, busy).
pub const NAK: u8 = 0x15;
/// Record cancelled by the receiver (collision on the link).
pub const CAN: u8 = 0x18;

/// Byte values that never appear inside an encoded record body.
pub const RESERVED: [u8; 4] = [START, ACK, NAK, CAN];

/// Returns true if `byte` is one of the reserved control values.
pub const fn is_reserved(byte: u8) -> bool {
    byte == START || byte == ACK || byte == NAK || byte == CAN
}

// ============================================================================
// Record Geometry
// ============================================================================

/// Maximum number of meaningful data bytes in a record.
pub const DATA_CAPACITY: usize = 32;

/// Raw (pre-offset) bytes covered by the checksum: address, function, length, data.
pub const RAW_BODY_LEN: usize = 3 + DATA_CAPACITY;

/// Total length of an encoded record:
/// start + offset + body + checksum.
pub const RECORD_LEN: usize = 2 + RAW_BODY_LEN + 1;

/// Address used for gateway-local functions (node list, protocol info).
pub const GATEWAY_ADDRESS: u8 = 0;

/// Highest unit id the coordinator can assign.
pub const MAX_UNIT_ID: u8 = 232;

/// Size of the node bitmap carried by [`FunctionId::GetInitData`] replies.
pub const NODE_BITMAP_LEN: usize = (MAX_UNIT_ID as usize + 7) / 8;

// ============================================================================
// Gateway Functions
// ============================================================================

/// Request the list of units known to the coordinator.
pub const FUNC_GET_INIT_DATA: u8 = 0x02;
/// Class payload received from a unit (reports, notifications).
pub const FUNC_APPLICATION_COMMAND: u8 = 0x04;
/// Send a class payload to a unit.
pub const FUNC_SEND_DATA: u8 = 0x13;
/// Query the coordinator firmware version.
pub const FUNC_GET_VERSION: u8 = 0x15;
/// Query the device type codes the coordinator holds for a unit.
pub const FUNC_GET_NODE_PROTOCOL_INFO: u8 = 0x41;
/// Node information frame (supported classes) relayed from a unit.
pub const FUNC_APPLICATION_UPDATE: u8 = 0x49;
/// Ask a unit to send its node information frame.
pub const FUNC_REQUEST_NODE_INFO: u8 = 0x60;

/// Gateway function carried in the second byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionId {
    /// Node list request/reply.
    GetInitData,
    /// Inbound class payload.
    ApplicationCommand,
    /// Outbound class payload.
    SendData,
    /// Coordinator version.
    GetVersion,
    /// Device type codes for one unit.
    GetNodeProtocolInfo,
    /// Node information frame.
    ApplicationUpdate,
    /// Node information request.
    RequestNodeInfo,
}

impl FunctionId {
    /// Map a raw function byte to a known function.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            FUNC_GET_INIT_DATA => Some(FunctionId::GetInitData),
            FUNC_APPLICATION_COMMAND => Some(FunctionId::ApplicationCommand),
            FUNC_SEND_DATA => Some(FunctionId::SendData),
            FUNC_GET_VERSION => Some(FunctionId::GetVersion),
            FUNC_GET_NODE_PROTOCOL_INFO => Some(FunctionId::GetNodeProtocolInfo),
            FUNC_APPLICATION_UPDATE => Some(FunctionId::ApplicationUpdate),
            FUNC_REQUEST_NODE_INFO => Some(FunctionId::RequestNodeInfo),
            _ => None,
        }
    }

    /// The raw function byte.
    pub fn as_u8(self) -> u8 {
        match self {
            FunctionId::GetInitData => FUNC_GET_INIT_DATA,
            FunctionId::ApplicationCommand => FUNC_APPLICATION_COMMAND,
            FunctionId::SendData => FUNC_SEND_DATA,
            FunctionId::GetVersion => FUNC_GET_VERSION,
            FunctionId::GetNodeProtocolInfo => FUNC_GET_NODE_PROTOCOL_INFO,
            FunctionId::ApplicationUpdate => FUNC_APPLICATION_UPDATE,
            FunctionId::RequestNodeInfo => FUNC_REQUEST_NODE_INFO,
        }
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FunctionId::GetInitData => "GET_INIT_DATA",
            FunctionId::ApplicationCommand => "APPLICATION_COMMAND",
            FunctionId::SendData => "SEND_DATA",
            FunctionId::GetVersion => "GET_VERSION",
            FunctionId::GetNodeProtocolInfo => "GET_NODE_PROTOCOL_INFO",
            FunctionId::ApplicationUpdate => "APPLICATION_UPDATE",
            FunctionId::RequestNodeInfo => "REQUEST_NODE_INFO",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Node Information Layout
// ============================================================================

/// Separates plain classes from secure classes in a node information frame.
pub const SECURE_CLASS_MARK: u8 = 0xF1;

/// Bit in the protocol-info flags byte set for always-listening units.
pub const NODE_FLAG_LISTENING: u8 = 0x80;
