mod api;
mod login;
mod ping;

pub use api::{
    AccessUrlResponse, ApiErrorBody, ApiErrorDetail, RegisterServerRequest, Server, User,
};
pub use login::LoginMessage;
pub use ping::PingMessage;
