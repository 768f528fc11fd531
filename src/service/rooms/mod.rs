pub mod protected;

pub use protected::{MemberIndex, ProtectedRoomRegistry, ProtectedRoomState};
