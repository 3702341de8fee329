pub mod chats;
pub mod generations;
pub mod provider_keys;
pub mod purchases;
pub mod schema;
pub mod user_api_keys;
pub mod users;
