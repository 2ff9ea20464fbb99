pub mod chat;
pub mod documents;
pub mod properties;
pub mod timeline;
pub mod users;
