//! 记忆层：按会话追加的消息日志与上下文窗口

pub mod conversation;

pub use conversation::{Message, MessageLog, NewMessage, Role};
