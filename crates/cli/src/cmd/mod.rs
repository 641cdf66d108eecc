mod clean;
mod forget;
mod show;
mod status;

pub use clean::cmd_clean;
pub use forget::cmd_forget;
pub use show::cmd_show;
pub use status::cmd_status;
