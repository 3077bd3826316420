// Generated protobuf/tonic code for the batching service.

pub mod batching {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/batching.v1.rs"));
    }
}

pub use batching::v1::{
    batching_client, batching_server, AdminReply, AdminRequest, ConnectionReply,
    ConnectionRequest, TensorMessage,
};
