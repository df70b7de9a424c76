//! Endpoints and the broadcast session that drives them

pub mod discovery;
pub mod endpoint;
pub mod lane;
pub mod manager;

pub use discovery::{Discovery, StaticDiscovery};
pub use endpoint::{
    CalibrationStatus, EndpointAddress, EndpointId, EndpointSnapshot, EndpointState,
    EndpointTarget,
};
pub use lane::{EndpointLanes, LaneContext};
pub use manager::{BroadcastSession, SessionSnapshot};
