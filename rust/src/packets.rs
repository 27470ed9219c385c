// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod hci {
    use num_derive::{FromPrimitive, ToPrimitive};
    use std::fmt;

    /// Status and reason codes, Bluetooth Core, Vol 1, Part F.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
    #[repr(u8)]
    pub enum ErrorCode {
        Success = 0x00,
        UnknownConnection = 0x02,
        AuthenticationFailure = 0x05,
        PinOrKeyMissing = 0x06,
        MemoryCapacityExceeded = 0x07,
        ConnectionTimeout = 0x08,
        ConnectionLimitExceeded = 0x09,
        CommandDisallowed = 0x0c,
        UnsupportedFeatureOrParameterValue = 0x11,
        InvalidHciCommandParameters = 0x12,
        RemoteUserTerminatedConnection = 0x13,
        RemoteDeviceTerminatedConnectionLowResources = 0x14,
        RemoteDeviceTerminatedConnectionPowerOff = 0x15,
        ConnectionTerminatedByLocalHost = 0x16,
        UnsupportedRemoteFeature = 0x1a,
        InvalidLmpOrLlParameters = 0x1e,
        UnspecifiedError = 0x1f,
        UnsupportedLmpOrLlParameterValue = 0x20,
        LmpOrLlResponseTimeout = 0x22,
        LlProcedureCollision = 0x23,
        LmpPduNotAllowed = 0x24,
        EncryptionModeNotAcceptable = 0x25,
        InstantPassed = 0x28,
        PairingWithUnitKeyNotSupported = 0x29,
        DifferentTransactionCollision = 0x2a,
        ControllerBusy = 0x3a,
        UnacceptableConnectionParameters = 0x3b,
        ConnectionTerminatedDueToMicFailure = 0x3d,
        ConnectionFailedToBeEstablished = 0x3e,
    }

    impl ErrorCode {
        /// Decode a reason carried in a control PDU. Values outside
        /// the vocabulary collapse to `UnspecifiedError`.
        pub fn from_reason(value: u8) -> ErrorCode {
            num_traits::FromPrimitive::from_u8(value).unwrap_or(ErrorCode::UnspecifiedError)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Role {
        Central,
        Peripheral,
    }

    /// A single LE PHY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
    #[repr(u8)]
    pub enum Phy {
        Le1m = 0x1,
        Le2m = 0x2,
        LeCoded = 0x3,
    }

    impl Phy {
        pub fn mask(self) -> PhyMask {
            match self {
                Phy::Le1m => PhyMask::LE_1M,
                Phy::Le2m => PhyMask::LE_2M,
                Phy::LeCoded => PhyMask::LE_CODED,
            }
        }
    }

    /// Set of LE PHYs, encoded as in LL_PHY_REQ.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PhyMask(pub u8);

    impl PhyMask {
        pub const NONE: PhyMask = PhyMask(0x0);
        pub const LE_1M: PhyMask = PhyMask(0x1);
        pub const LE_2M: PhyMask = PhyMask(0x2);
        pub const LE_CODED: PhyMask = PhyMask(0x4);
        pub const ALL: PhyMask = PhyMask(0x7);

        pub fn is_empty(self) -> bool {
            self.0 & 0x7 == 0
        }

        pub fn contains(self, phy: Phy) -> bool {
            self.0 & phy.mask().0 != 0
        }

        pub fn intersect(self, other: PhyMask) -> PhyMask {
            PhyMask(self.0 & other.0 & 0x7)
        }

        /// Select one phy in the mask with
        /// the priority LE 2M > LE 1M > LE Coded.
        pub fn select(self) -> Option<Phy> {
            if self.contains(Phy::Le2m) {
                Some(Phy::Le2m)
            } else if self.contains(Phy::Le1m) {
                Some(Phy::Le1m)
            } else if self.contains(Phy::LeCoded) {
                Some(Phy::LeCoded)
            } else {
                None
            }
        }
    }

    /// LE feature bits, Bluetooth Core, Vol 6, Part B, 4.6.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum LlFeaturesBits {
        LeEncryption = 0,
        ConnectionParametersRequestProcedure = 1,
        ExtendedRejectIndication = 2,
        PeripheralInitiatedFeaturesExchange = 3,
        LePing = 4,
        LeDataPacketLengthExtension = 5,
        Le2mPhy = 8,
        LeCodedPhy = 11,
        ChannelSelectionAlgorithm2 = 14,
        MinimumNumberOfUsedChannelsProcedure = 16,
        PeriodicAdvertisingSyncTransferSender = 24,
        PeriodicAdvertisingSyncTransferRecipient = 25,
        SleepClockAccuracyUpdates = 26,
    }

    impl From<LlFeaturesBits> for u64 {
        fn from(bit: LlFeaturesBits) -> u64 {
            1 << (bit as u8)
        }
    }

    /// Bits of the feature set that are only valid between controllers
    /// when both sides support them.
    pub const LL_FEATURES_BYTE0_MASK: u64 = 0xff;

    /// Events pushed to the host. Field naming follows the
    /// corresponding HCI event parameters.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        DisconnectionComplete {
            status: ErrorCode,
            connection_handle: u16,
            reason: ErrorCode,
        },
        EncryptionChange {
            status: ErrorCode,
            connection_handle: u16,
            encryption_enabled: bool,
        },
        EncryptionKeyRefreshComplete {
            status: ErrorCode,
            connection_handle: u16,
        },
        ReadRemoteVersionInformationComplete {
            status: ErrorCode,
            connection_handle: u16,
            version: u8,
            manufacturer_name: u16,
            subversion: u16,
        },
        NumberOfCompletedPackets {
            connection_handle: u16,
            num_completed_packets: u16,
        },
        AuthenticatedPayloadTimeoutExpired {
            connection_handle: u16,
        },
        LeConnectionUpdateComplete {
            status: ErrorCode,
            connection_handle: u16,
            connection_interval: u16,
            peripheral_latency: u16,
            supervision_timeout: u16,
        },
        LeReadRemoteFeaturesComplete {
            status: ErrorCode,
            connection_handle: u16,
            le_features: u64,
        },
        LeLongTermKeyRequest {
            connection_handle: u16,
            random_number: u64,
            encrypted_diversifier: u16,
        },
        LeRemoteConnectionParameterRequest {
            connection_handle: u16,
            interval_min: u16,
            interval_max: u16,
            max_latency: u16,
            timeout: u16,
        },
        LeDataLengthChange {
            connection_handle: u16,
            max_tx_octets: u16,
            max_tx_time: u16,
            max_rx_octets: u16,
            max_rx_time: u16,
        },
        LePhyUpdateComplete {
            status: ErrorCode,
            connection_handle: u16,
            tx_phy: Phy,
            rx_phy: Phy,
        },
        LeRequestPeerScaComplete {
            status: ErrorCode,
            connection_handle: u16,
            peer_clock_accuracy: u8,
        },
        LePeriodicAdvertisingSyncTransferReceived {
            status: ErrorCode,
            connection_handle: u16,
            service_data: u16,
            sync_info: [u8; 18],
            adv_address: [u8; 6],
            adv_sid: u8,
            adv_phy: u8,
        },
        LePeriodicAdvertisingSyncTransferComplete {
            status: ErrorCode,
            connection_handle: u16,
        },
        LeMinUsedChannelsComplete {
            status: ErrorCode,
            connection_handle: u16,
        },
    }

    impl fmt::Display for ErrorCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?} (0x{:02x})", self, *self as u8)
        }
    }
}

pub mod llcp {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use num_derive::{FromPrimitive, ToPrimitive};
    use num_traits::FromPrimitive;
    use thiserror::Error;

    /// Size of the data channel PDU header.
    pub const DATA_HEADER_LEN: usize = 2;
    /// Size of the message integrity check appended to encrypted payloads.
    pub const MIC_LEN: usize = 4;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DecodeError {
        #[error("Unknown LLCP opcode 0x{0:02x}")]
        UnknownOpcode(u8),
        #[error("Invalid length {length} for {opcode:?}")]
        InvalidLength { opcode: Opcode, length: usize },
        #[error("Truncated PDU")]
        Truncated,
        #[error("Reserved LLID")]
        InvalidLlid,
    }

    /// Link layer identifier carried in the data channel header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
    #[repr(u8)]
    pub enum Llid {
        /// Continuation fragment of an L2CAP message, or empty PDU.
        Continuation = 0x1,
        /// Start of an L2CAP message.
        Start = 0x2,
        Control = 0x3,
    }

    /// 16-bit data channel header preceding the payload.
    ///
    /// ```notrust
    /// LSB                                                               MSB
    /// +----------+---------+---------+---------+----------+--------------+
    /// |   LLID   |  NESN   |   SN    |   MD    |    -     |    Length    |
    /// | (2 bits) | (1 bit) | (1 bit) | (1 bit) | (3 bits) |   (8 bits)   |
    /// +----------+---------+---------+---------+----------+--------------+
    /// ```
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DataHeader {
        pub llid: Llid,
        pub nesn: bool,
        pub sn: bool,
        pub md: bool,
        pub length: u8,
    }

    impl DataHeader {
        pub fn empty(sn: bool, nesn: bool, md: bool) -> DataHeader {
            DataHeader { llid: Llid::Continuation, nesn, sn, md, length: 0 }
        }

        pub fn parse(bytes: [u8; DATA_HEADER_LEN]) -> Result<DataHeader, DecodeError> {
            let llid = Llid::from_u8(bytes[0] & 0x3).ok_or(DecodeError::InvalidLlid)?;
            Ok(DataHeader {
                llid,
                nesn: bytes[0] & 0x4 != 0,
                sn: bytes[0] & 0x8 != 0,
                md: bytes[0] & 0x10 != 0,
                length: bytes[1],
            })
        }

        pub fn to_bytes(&self) -> [u8; DATA_HEADER_LEN] {
            let mut first = self.llid as u8;
            if self.nesn {
                first |= 0x4;
            }
            if self.sn {
                first |= 0x8;
            }
            if self.md {
                first |= 0x10;
            }
            [first, self.length]
        }

        pub fn is_empty_pdu(&self) -> bool {
            self.llid == Llid::Continuation && self.length == 0
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
    #[repr(u8)]
    pub enum Opcode {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0a,
        PauseEncRsp = 0x0b,
        VersionInd = 0x0c,
        RejectInd = 0x0d,
        PeripheralFeatureReq = 0x0e,
        ConnectionParamReq = 0x0f,
        ConnectionParamRsp = 0x10,
        RejectExtInd = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
        PhyReq = 0x16,
        PhyRsp = 0x17,
        PhyUpdateInd = 0x18,
        MinUsedChannelsInd = 0x19,
        PeriodicSyncInd = 0x1c,
        ClockAccuracyReq = 0x1d,
        ClockAccuracyRsp = 0x1e,
    }

    impl Opcode {
        /// Length of the opcode specific payload, excluding the opcode.
        pub fn payload_len(self) -> usize {
            match self {
                Opcode::ConnectionUpdateInd => 11,
                Opcode::ChannelMapInd => 7,
                Opcode::TerminateInd | Opcode::UnknownRsp | Opcode::RejectInd => 1,
                Opcode::EncReq => 22,
                Opcode::EncRsp => 12,
                Opcode::StartEncReq
                | Opcode::StartEncRsp
                | Opcode::PauseEncReq
                | Opcode::PauseEncRsp
                | Opcode::PingReq
                | Opcode::PingRsp => 0,
                Opcode::FeatureReq | Opcode::FeatureRsp | Opcode::PeripheralFeatureReq => 8,
                Opcode::VersionInd => 5,
                Opcode::ConnectionParamReq | Opcode::ConnectionParamRsp => 23,
                Opcode::RejectExtInd => 2,
                Opcode::LengthReq | Opcode::LengthRsp => 8,
                Opcode::PhyReq | Opcode::PhyRsp | Opcode::MinUsedChannelsInd => 2,
                Opcode::PhyUpdateInd => 4,
                Opcode::PeriodicSyncInd => 34,
                Opcode::ClockAccuracyReq | Opcode::ClockAccuracyRsp => 1,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnectionUpdateInd {
        pub win_size: u8,
        pub win_offset: u16,
        pub interval: u16,
        pub latency: u16,
        pub timeout: u16,
        pub instant: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelMapInd {
        pub channel_map: u64,
        pub instant: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TerminateInd {
        pub error_code: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EncReq {
        pub rand: u64,
        pub ediv: u16,
        pub skd_c: u64,
        pub iv_c: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EncRsp {
        pub skd_p: u64,
        pub iv_p: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UnknownRsp {
        pub unknown_type: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FeatureReq {
        pub features: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FeatureRsp {
        pub features: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PeripheralFeatureReq {
        pub features: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VersionInd {
        pub version: u8,
        pub company_id: u16,
        pub subversion: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RejectInd {
        pub error_code: u8,
    }

    /// Payload shared by LL_CONNECTION_PARAM_REQ and LL_CONNECTION_PARAM_RSP.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConnectionParam {
        pub interval_min: u16,
        pub interval_max: u16,
        pub latency: u16,
        pub timeout: u16,
        pub preferred_periodicity: u8,
        pub reference_conn_event_count: u16,
        pub offsets: [u16; 6],
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnectionParamReq(pub ConnectionParam);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnectionParamRsp(pub ConnectionParam);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RejectExtInd {
        pub reject_opcode: u8,
        pub error_code: u8,
    }

    /// Payload shared by LL_LENGTH_REQ and LL_LENGTH_RSP.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Length {
        pub max_rx_octets: u16,
        pub max_rx_time: u16,
        pub max_tx_octets: u16,
        pub max_tx_time: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LengthReq(pub Length);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LengthRsp(pub Length);

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PhyReq {
        pub tx_phys: u8,
        pub rx_phys: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PhyRsp {
        pub tx_phys: u8,
        pub rx_phys: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PhyUpdateInd {
        pub phy_c_to_p: u8,
        pub phy_p_to_c: u8,
        pub instant: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MinUsedChannelsInd {
        pub phys: u8,
        pub min_used_channels: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PeriodicSyncInd {
        pub id: u16,
        pub sync_info: [u8; 18],
        pub conn_event_count: u16,
        pub last_pa_event_counter: u16,
        pub sid: u8,
        pub a_type: u8,
        pub sca: u8,
        pub phy: u8,
        pub adv_a: [u8; 6],
        pub sync_conn_event_count: u16,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClockAccuracyReq {
        pub sca: u8,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClockAccuracyRsp {
        pub sca: u8,
    }

    /// Any decoded LL Control PDU.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LlcpPacket {
        ConnectionUpdateInd(ConnectionUpdateInd),
        ChannelMapInd(ChannelMapInd),
        TerminateInd(TerminateInd),
        EncReq(EncReq),
        EncRsp(EncRsp),
        StartEncReq,
        StartEncRsp,
        UnknownRsp(UnknownRsp),
        FeatureReq(FeatureReq),
        FeatureRsp(FeatureRsp),
        PauseEncReq,
        PauseEncRsp,
        VersionInd(VersionInd),
        RejectInd(RejectInd),
        PeripheralFeatureReq(PeripheralFeatureReq),
        ConnectionParamReq(ConnectionParamReq),
        ConnectionParamRsp(ConnectionParamRsp),
        RejectExtInd(RejectExtInd),
        PingReq,
        PingRsp,
        LengthReq(LengthReq),
        LengthRsp(LengthRsp),
        PhyReq(PhyReq),
        PhyRsp(PhyRsp),
        PhyUpdateInd(PhyUpdateInd),
        MinUsedChannelsInd(MinUsedChannelsInd),
        PeriodicSyncInd(PeriodicSyncInd),
        ClockAccuracyReq(ClockAccuracyReq),
        ClockAccuracyRsp(ClockAccuracyRsp),
    }

    macro_rules! impl_into_llcp_packet {
        ($($T:ident),+ $(,)?) => {
            $(
                impl From<$T> for LlcpPacket {
                    fn from(packet: $T) -> Self {
                        LlcpPacket::$T(packet)
                    }
                }
            )+
        };
    }

    impl_into_llcp_packet!(
        ConnectionUpdateInd,
        ChannelMapInd,
        TerminateInd,
        EncReq,
        EncRsp,
        UnknownRsp,
        FeatureReq,
        FeatureRsp,
        VersionInd,
        RejectInd,
        PeripheralFeatureReq,
        ConnectionParamReq,
        ConnectionParamRsp,
        RejectExtInd,
        LengthReq,
        LengthRsp,
        PhyReq,
        PhyRsp,
        PhyUpdateInd,
        MinUsedChannelsInd,
        PeriodicSyncInd,
        ClockAccuracyReq,
        ClockAccuracyRsp,
    );

    fn get_connection_param(buf: &mut &[u8]) -> ConnectionParam {
        let mut param = ConnectionParam {
            interval_min: buf.get_u16_le(),
            interval_max: buf.get_u16_le(),
            latency: buf.get_u16_le(),
            timeout: buf.get_u16_le(),
            preferred_periodicity: buf.get_u8(),
            reference_conn_event_count: buf.get_u16_le(),
            offsets: [0; 6],
        };
        for offset in param.offsets.iter_mut() {
            *offset = buf.get_u16_le();
        }
        param
    }

    fn put_connection_param(buf: &mut BytesMut, param: &ConnectionParam) {
        buf.put_u16_le(param.interval_min);
        buf.put_u16_le(param.interval_max);
        buf.put_u16_le(param.latency);
        buf.put_u16_le(param.timeout);
        buf.put_u8(param.preferred_periodicity);
        buf.put_u16_le(param.reference_conn_event_count);
        for offset in param.offsets {
            buf.put_u16_le(offset);
        }
    }

    fn get_length(buf: &mut &[u8]) -> Length {
        Length {
            max_rx_octets: buf.get_u16_le(),
            max_rx_time: buf.get_u16_le(),
            max_tx_octets: buf.get_u16_le(),
            max_tx_time: buf.get_u16_le(),
        }
    }

    fn put_length(buf: &mut BytesMut, length: &Length) {
        buf.put_u16_le(length.max_rx_octets);
        buf.put_u16_le(length.max_rx_time);
        buf.put_u16_le(length.max_tx_octets);
        buf.put_u16_le(length.max_tx_time);
    }

    impl LlcpPacket {
        pub fn opcode(&self) -> Opcode {
            match self {
                LlcpPacket::ConnectionUpdateInd(_) => Opcode::ConnectionUpdateInd,
                LlcpPacket::ChannelMapInd(_) => Opcode::ChannelMapInd,
                LlcpPacket::TerminateInd(_) => Opcode::TerminateInd,
                LlcpPacket::EncReq(_) => Opcode::EncReq,
                LlcpPacket::EncRsp(_) => Opcode::EncRsp,
                LlcpPacket::StartEncReq => Opcode::StartEncReq,
                LlcpPacket::StartEncRsp => Opcode::StartEncRsp,
                LlcpPacket::UnknownRsp(_) => Opcode::UnknownRsp,
                LlcpPacket::FeatureReq(_) => Opcode::FeatureReq,
                LlcpPacket::FeatureRsp(_) => Opcode::FeatureRsp,
                LlcpPacket::PauseEncReq => Opcode::PauseEncReq,
                LlcpPacket::PauseEncRsp => Opcode::PauseEncRsp,
                LlcpPacket::VersionInd(_) => Opcode::VersionInd,
                LlcpPacket::RejectInd(_) => Opcode::RejectInd,
                LlcpPacket::PeripheralFeatureReq(_) => Opcode::PeripheralFeatureReq,
                LlcpPacket::ConnectionParamReq(_) => Opcode::ConnectionParamReq,
                LlcpPacket::ConnectionParamRsp(_) => Opcode::ConnectionParamRsp,
                LlcpPacket::RejectExtInd(_) => Opcode::RejectExtInd,
                LlcpPacket::PingReq => Opcode::PingReq,
                LlcpPacket::PingRsp => Opcode::PingRsp,
                LlcpPacket::LengthReq(_) => Opcode::LengthReq,
                LlcpPacket::LengthRsp(_) => Opcode::LengthRsp,
                LlcpPacket::PhyReq(_) => Opcode::PhyReq,
                LlcpPacket::PhyRsp(_) => Opcode::PhyRsp,
                LlcpPacket::PhyUpdateInd(_) => Opcode::PhyUpdateInd,
                LlcpPacket::MinUsedChannelsInd(_) => Opcode::MinUsedChannelsInd,
                LlcpPacket::PeriodicSyncInd(_) => Opcode::PeriodicSyncInd,
                LlcpPacket::ClockAccuracyReq(_) => Opcode::ClockAccuracyReq,
                LlcpPacket::ClockAccuracyRsp(_) => Opcode::ClockAccuracyRsp,
            }
        }

        /// Parse an LL Control PDU payload (opcode followed by the
        /// opcode specific fields, without the data channel header).
        pub fn parse(data: &[u8]) -> Result<LlcpPacket, DecodeError> {
            let (&raw_opcode, mut buf) = data.split_first().ok_or(DecodeError::Truncated)?;
            let opcode =
                Opcode::from_u8(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;
            if buf.len() != opcode.payload_len() {
                return Err(DecodeError::InvalidLength { opcode, length: buf.len() });
            }

            let buf = &mut buf;
            Ok(match opcode {
                Opcode::ConnectionUpdateInd => {
                    LlcpPacket::ConnectionUpdateInd(self::ConnectionUpdateInd {
                        win_size: buf.get_u8(),
                        win_offset: buf.get_u16_le(),
                        interval: buf.get_u16_le(),
                        latency: buf.get_u16_le(),
                        timeout: buf.get_u16_le(),
                        instant: buf.get_u16_le(),
                    })
                }
                Opcode::ChannelMapInd => LlcpPacket::ChannelMapInd(self::ChannelMapInd {
                    channel_map: buf.get_uint_le(5),
                    instant: buf.get_u16_le(),
                }),
                Opcode::TerminateInd => {
                    LlcpPacket::TerminateInd(self::TerminateInd { error_code: buf.get_u8() })
                }
                Opcode::EncReq => LlcpPacket::EncReq(self::EncReq {
                    rand: buf.get_u64_le(),
                    ediv: buf.get_u16_le(),
                    skd_c: buf.get_u64_le(),
                    iv_c: buf.get_u32_le(),
                }),
                Opcode::EncRsp => LlcpPacket::EncRsp(self::EncRsp {
                    skd_p: buf.get_u64_le(),
                    iv_p: buf.get_u32_le(),
                }),
                Opcode::StartEncReq => LlcpPacket::StartEncReq,
                Opcode::StartEncRsp => LlcpPacket::StartEncRsp,
                Opcode::UnknownRsp => {
                    LlcpPacket::UnknownRsp(self::UnknownRsp { unknown_type: buf.get_u8() })
                }
                Opcode::FeatureReq => {
                    LlcpPacket::FeatureReq(self::FeatureReq { features: buf.get_u64_le() })
                }
                Opcode::FeatureRsp => {
                    LlcpPacket::FeatureRsp(self::FeatureRsp { features: buf.get_u64_le() })
                }
                Opcode::PauseEncReq => LlcpPacket::PauseEncReq,
                Opcode::PauseEncRsp => LlcpPacket::PauseEncRsp,
                Opcode::VersionInd => LlcpPacket::VersionInd(self::VersionInd {
                    version: buf.get_u8(),
                    company_id: buf.get_u16_le(),
                    subversion: buf.get_u16_le(),
                }),
                Opcode::RejectInd => {
                    LlcpPacket::RejectInd(self::RejectInd { error_code: buf.get_u8() })
                }
                Opcode::PeripheralFeatureReq => {
                    LlcpPacket::PeripheralFeatureReq(self::PeripheralFeatureReq {
                        features: buf.get_u64_le(),
                    })
                }
                Opcode::ConnectionParamReq => {
                    LlcpPacket::ConnectionParamReq(self::ConnectionParamReq(get_connection_param(
                        buf,
                    )))
                }
                Opcode::ConnectionParamRsp => {
                    LlcpPacket::ConnectionParamRsp(self::ConnectionParamRsp(get_connection_param(
                        buf,
                    )))
                }
                Opcode::RejectExtInd => LlcpPacket::RejectExtInd(self::RejectExtInd {
                    reject_opcode: buf.get_u8(),
                    error_code: buf.get_u8(),
                }),
                Opcode::PingReq => LlcpPacket::PingReq,
                Opcode::PingRsp => LlcpPacket::PingRsp,
                Opcode::LengthReq => LlcpPacket::LengthReq(self::LengthReq(get_length(buf))),
                Opcode::LengthRsp => LlcpPacket::LengthRsp(self::LengthRsp(get_length(buf))),
                Opcode::PhyReq => LlcpPacket::PhyReq(self::PhyReq {
                    tx_phys: buf.get_u8(),
                    rx_phys: buf.get_u8(),
                }),
                Opcode::PhyRsp => LlcpPacket::PhyRsp(self::PhyRsp {
                    tx_phys: buf.get_u8(),
                    rx_phys: buf.get_u8(),
                }),
                Opcode::PhyUpdateInd => LlcpPacket::PhyUpdateInd(self::PhyUpdateInd {
                    phy_c_to_p: buf.get_u8(),
                    phy_p_to_c: buf.get_u8(),
                    instant: buf.get_u16_le(),
                }),
                Opcode::MinUsedChannelsInd => {
                    LlcpPacket::MinUsedChannelsInd(self::MinUsedChannelsInd {
                        phys: buf.get_u8(),
                        min_used_channels: buf.get_u8(),
                    })
                }
                Opcode::PeriodicSyncInd => {
                    let id = buf.get_u16_le();
                    let mut sync_info = [0; 18];
                    buf.copy_to_slice(&mut sync_info);
                    let conn_event_count = buf.get_u16_le();
                    let last_pa_event_counter = buf.get_u16_le();
                    let sid_atype_sca = buf.get_u8();
                    let phy = buf.get_u8();
                    let mut adv_a = [0; 6];
                    buf.copy_to_slice(&mut adv_a);
                    LlcpPacket::PeriodicSyncInd(self::PeriodicSyncInd {
                        id,
                        sync_info,
                        conn_event_count,
                        last_pa_event_counter,
                        sid: sid_atype_sca & 0xf,
                        a_type: (sid_atype_sca >> 4) & 0x1,
                        sca: sid_atype_sca >> 5,
                        phy,
                        adv_a,
                        sync_conn_event_count: buf.get_u16_le(),
                    })
                }
                Opcode::ClockAccuracyReq => {
                    LlcpPacket::ClockAccuracyReq(self::ClockAccuracyReq { sca: buf.get_u8() })
                }
                Opcode::ClockAccuracyRsp => {
                    LlcpPacket::ClockAccuracyRsp(self::ClockAccuracyRsp { sca: buf.get_u8() })
                }
            })
        }

        pub fn to_bytes(&self) -> Bytes {
            let opcode = self.opcode();
            let mut buf = BytesMut::with_capacity(1 + opcode.payload_len());
            buf.put_u8(opcode as u8);

            match self {
                LlcpPacket::ConnectionUpdateInd(pdu) => {
                    buf.put_u8(pdu.win_size);
                    buf.put_u16_le(pdu.win_offset);
                    buf.put_u16_le(pdu.interval);
                    buf.put_u16_le(pdu.latency);
                    buf.put_u16_le(pdu.timeout);
                    buf.put_u16_le(pdu.instant);
                }
                LlcpPacket::ChannelMapInd(pdu) => {
                    buf.put_uint_le(pdu.channel_map, 5);
                    buf.put_u16_le(pdu.instant);
                }
                LlcpPacket::TerminateInd(pdu) => buf.put_u8(pdu.error_code),
                LlcpPacket::EncReq(pdu) => {
                    buf.put_u64_le(pdu.rand);
                    buf.put_u16_le(pdu.ediv);
                    buf.put_u64_le(pdu.skd_c);
                    buf.put_u32_le(pdu.iv_c);
                }
                LlcpPacket::EncRsp(pdu) => {
                    buf.put_u64_le(pdu.skd_p);
                    buf.put_u32_le(pdu.iv_p);
                }
                LlcpPacket::UnknownRsp(pdu) => buf.put_u8(pdu.unknown_type),
                LlcpPacket::FeatureReq(pdu) => buf.put_u64_le(pdu.features),
                LlcpPacket::FeatureRsp(pdu) => buf.put_u64_le(pdu.features),
                LlcpPacket::PeripheralFeatureReq(pdu) => buf.put_u64_le(pdu.features),
                LlcpPacket::VersionInd(pdu) => {
                    buf.put_u8(pdu.version);
                    buf.put_u16_le(pdu.company_id);
                    buf.put_u16_le(pdu.subversion);
                }
                LlcpPacket::RejectInd(pdu) => buf.put_u8(pdu.error_code),
                LlcpPacket::ConnectionParamReq(pdu) => put_connection_param(&mut buf, &pdu.0),
                LlcpPacket::ConnectionParamRsp(pdu) => put_connection_param(&mut buf, &pdu.0),
                LlcpPacket::RejectExtInd(pdu) => {
                    buf.put_u8(pdu.reject_opcode);
                    buf.put_u8(pdu.error_code);
                }
                LlcpPacket::LengthReq(pdu) => put_length(&mut buf, &pdu.0),
                LlcpPacket::LengthRsp(pdu) => put_length(&mut buf, &pdu.0),
                LlcpPacket::PhyReq(pdu) => {
                    buf.put_u8(pdu.tx_phys);
                    buf.put_u8(pdu.rx_phys);
                }
                LlcpPacket::PhyRsp(pdu) => {
                    buf.put_u8(pdu.tx_phys);
                    buf.put_u8(pdu.rx_phys);
                }
                LlcpPacket::PhyUpdateInd(pdu) => {
                    buf.put_u8(pdu.phy_c_to_p);
                    buf.put_u8(pdu.phy_p_to_c);
                    buf.put_u16_le(pdu.instant);
                }
                LlcpPacket::MinUsedChannelsInd(pdu) => {
                    buf.put_u8(pdu.phys);
                    buf.put_u8(pdu.min_used_channels);
                }
                LlcpPacket::PeriodicSyncInd(pdu) => {
                    buf.put_u16_le(pdu.id);
                    buf.put_slice(&pdu.sync_info);
                    buf.put_u16_le(pdu.conn_event_count);
                    buf.put_u16_le(pdu.last_pa_event_counter);
                    buf.put_u8((pdu.sid & 0xf) | ((pdu.a_type & 0x1) << 4) | (pdu.sca << 5));
                    buf.put_u8(pdu.phy);
                    buf.put_slice(&pdu.adv_a);
                    buf.put_u16_le(pdu.sync_conn_event_count);
                }
                LlcpPacket::ClockAccuracyReq(pdu) => buf.put_u8(pdu.sca),
                LlcpPacket::ClockAccuracyRsp(pdu) => buf.put_u8(pdu.sca),
                LlcpPacket::StartEncReq
                | LlcpPacket::StartEncRsp
                | LlcpPacket::PauseEncReq
                | LlcpPacket::PauseEncRsp
                | LlcpPacket::PingReq
                | LlcpPacket::PingRsp => (),
            }

            buf.freeze()
        }

        pub fn encode_to_vec(&self) -> Vec<u8> {
            self.to_bytes().to_vec()
        }
    }

}
