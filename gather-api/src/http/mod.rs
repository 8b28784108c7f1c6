mod auth;
mod chat;
mod chatroom;
mod error;
mod user;
mod websocket;

pub use error::{AppError, AppResult};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use gather_core::auth::JwtService;
use gather_core::hub::Hub;
use gather_core::repository::{ChatRepository, ChatroomRepository, UserRepository};

#[derive(Clone)]
pub struct AppState {
    pub users: UserRepository,
    pub chatrooms: ChatroomRepository,
    pub chats: ChatRepository,
    pub jwt: JwtService,
    pub hub: Arc<Hub>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/sign-up", post(auth::sign_up))
        .route("/auth/sign-in", post(auth::sign_in))
        .route("/auth/sign-out", post(auth::sign_out))
        .route("/users", get(user::list_users))
        .route("/users/me", get(user::my_profile))
        .route(
            "/users/{id}",
            get(user::get_user)
                .patch(user::update_user)
                .delete(user::delete_user),
        )
        .route(
            "/chatrooms",
            get(chatroom::list_chatrooms).post(chatroom::create_chatroom),
        )
        .route(
            "/chatrooms/{id}",
            get(chatroom::get_chatroom)
                .patch(chatroom::update_chatroom)
                .delete(chatroom::delete_chatroom),
        )
        .route("/chatrooms/{id}/join", post(chatroom::join_chatroom))
        .route("/chats", get(chat::list_chats))
        .route("/chats/{id}", get(chat::get_chat))
        .route("/ws", get(websocket::connect))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
