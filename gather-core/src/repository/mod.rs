mod chat;
mod chatroom;
mod user;

pub use chat::ChatRepository;
pub use chatroom::ChatroomRepository;
pub use user::UserRepository;
