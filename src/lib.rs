pub mod config;
pub mod events;
pub mod framework;
pub mod infrastructure;
pub mod machine;
pub mod machine_set;
pub mod nodes;
pub mod operator;
pub mod poll;
pub mod providers;
