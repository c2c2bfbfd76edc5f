pub mod commands;
pub mod connection;
pub mod coordinator;
pub mod device;
pub mod modbus;
pub mod registers;
pub mod simulator;
