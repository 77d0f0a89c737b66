//! 记忆层：对话消息与按会话 key 存储的有界历史

pub mod conversation;
pub mod session_store;

pub use conversation::{Message, Role};
pub use session_store::{KeyedLocks, LruSessionStore, SessionLock, SessionStore};
