pub mod cpu_info;
pub mod numa;
pub mod platform;
