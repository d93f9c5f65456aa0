//! Protobuf messages exchanged between channel participants.
//!
//! Field numbers follow the Perun `wire.proto` so that the encoding stays
//! compatible with other Perun clients.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "envelope::Msg", tags = "3, 4, 5, 6, 7")]
    pub msg: ::core::option::Option<envelope::Msg>,
}

/// Nested message and enum types in `Envelope`.
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "3")]
        ChannelUpdateMsg(super::ChannelUpdateMsg),
        #[prost(message, tag = "4")]
        ChannelUpdateAccMsg(super::ChannelUpdateAccMsg),
        #[prost(message, tag = "5")]
        ChannelUpdateRejMsg(super::ChannelUpdateRejMsg),
        #[prost(message, tag = "6")]
        VirtualChannelFundingProposalMsg(super::VirtualChannelFundingProposalMsg),
        #[prost(message, tag = "7")]
        VirtualChannelSettlementProposalMsg(super::VirtualChannelSettlementProposalMsg),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Balance {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub balance: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Balances {
    #[prost(message, repeated, tag = "1")]
    pub balances: ::prost::alloc::vec::Vec<Balance>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexMap {
    #[prost(uint32, repeated, tag = "1")]
    pub index_map: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubAlloc {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub bals: ::core::option::Option<Balance>,
    #[prost(message, optional, tag = "3")]
    pub index_map: ::core::option::Option<IndexMap>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Allocation {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub assets: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, optional, tag = "2")]
    pub balances: ::core::option::Option<Balances>,
    #[prost(message, repeated, tag = "3")]
    pub locked: ::prost::alloc::vec::Vec<SubAlloc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Params {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub parts: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", tag = "4")]
    pub app: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub nonce: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "6")]
    pub ledger_channel: bool,
    #[prost(bool, tag = "7")]
    pub virtual_channel: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct State {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub app: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub allocation: ::core::option::Option<Allocation>,
    #[prost(bytes = "vec", tag = "5")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "6")]
    pub is_final: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedState {
    #[prost(message, optional, tag = "1")]
    pub params: ::core::option::Option<Params>,
    #[prost(message, optional, tag = "2")]
    pub state: ::core::option::Option<State>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub sigs: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelUpdate {
    #[prost(message, optional, tag = "1")]
    pub state: ::core::option::Option<State>,
    #[prost(uint32, tag = "2")]
    pub actor_idx: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelUpdateMsg {
    #[prost(message, optional, tag = "1")]
    pub channel_update: ::core::option::Option<ChannelUpdate>,
    #[prost(bytes = "vec", tag = "2")]
    pub sig: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualChannelFundingProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub channel_update_msg: ::core::option::Option<ChannelUpdateMsg>,
    #[prost(message, optional, tag = "2")]
    pub initial: ::core::option::Option<SignedState>,
    #[prost(message, optional, tag = "3")]
    pub index_map: ::core::option::Option<IndexMap>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualChannelSettlementProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub channel_update_msg: ::core::option::Option<ChannelUpdateMsg>,
    #[prost(message, optional, tag = "2")]
    pub r#final: ::core::option::Option<SignedState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelUpdateAccMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub sig: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelUpdateRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(string, tag = "3")]
    pub reason: ::prost::alloc::string::String,
}
