pub mod health;
pub mod logs;
pub mod query;
pub mod resolver;
pub mod rules;
pub mod settings;
