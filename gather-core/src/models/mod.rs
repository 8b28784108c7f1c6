mod chat;
mod chatroom;
mod id;
mod user;

pub use chat::{Chat, ChatWithSender};
pub use chatroom::Chatroom;
pub use id::{ChatId, RoomId, UserId};
pub use user::User;
