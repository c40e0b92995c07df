//! SCADA-facing protocol servers. Both serve reads from the latest committed
//! snapshot and route writes through the command router.

pub mod dnp3;
pub mod modbus;
