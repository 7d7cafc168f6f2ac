mod admin;

pub use admin::AdminServer;
