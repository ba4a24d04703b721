use crate::epos_main::Epos;
use crate::*;

pub const CONTROL_WORD_INDEX: u16 = 0x6040;
pub const MODES_OPERATION_INDEX: u16 = 0x6060;
pub const VELOCITY_MODE_SP_INDEX: u16 = 0x206B;
pub const POSITION_MODE_SP_INDEX: u16 = 0x2062;
pub const TARGET_VELOCITY_INDEX: u16 = 0x60FF;
pub const TARGET_POSITION_INDEX: u16 = 0x607A;

pub const FAULT_RESET_CMD: u32 = 0x0080;
pub const SHUTDOWN_CMD: u32 = 0x0006;
pub const SWITCH_ON_CMD: u32 = 0x0007;
pub const ENABLE_OPERATION_CMD: u32 = 0x000F;
pub const HALT_CMD: u32 = 0x0102;
pub const GOTO_POSITION_REL_CMD: u32 = 0x007F;
pub const GOTO_POSITION_ABS_CMD: u32 = 0x003F;
pub const GOTO_VELOCITY_CMD: u32 = 0x000F;

/// Modes of operation (object 0x6060)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Homing = 0x06,
    ProfileVelocity = 0x03,
    ProfilePosition = 0x01,
    Position = 0xFF,
    Velocity = 0xFE,
    Current = 0xFD,
    Diagnostic = 0xFC,
    MasterEncoder = 0xFB,
    StepDirection = 0xFA,
}

impl Mode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x06 => Some(Self::Homing),
            0x03 => Some(Self::ProfileVelocity),
            0x01 => Some(Self::ProfilePosition),
            0xFF => Some(Self::Position),
            0xFE => Some(Self::Velocity),
            0xFD => Some(Self::Current),
            0xFC => Some(Self::Diagnostic),
            0xFB => Some(Self::MasterEncoder),
            0xFA => Some(Self::StepDirection),
            _ => None,
        }
    }
}

/// Controlword and set point helpers. Each one admits a single write
/// request and returns immediately, like [`Epos::write_object`].
impl<INTF> Epos<INTF>
where
    INTF: SerialInterface,
{
    fn control(&self, node_id: u8, command: u32) -> Result<(), EposError> {
        self.write_object(CONTROL_WORD_INDEX, 0, node_id, command)
    }

    pub fn fault_reset(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, FAULT_RESET_CMD)
    }

    pub fn shutdown(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, SHUTDOWN_CMD)
    }

    pub fn switch_on(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, SWITCH_ON_CMD)
    }

    pub fn enable_operation(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, ENABLE_OPERATION_CMD)
    }

    pub fn halt(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, HALT_CMD)
    }

    pub fn goto_position_rel(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, GOTO_POSITION_REL_CMD)
    }

    pub fn goto_position_abs(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, GOTO_POSITION_ABS_CMD)
    }

    pub fn goto_velocity(&self, node_id: u8) -> Result<(), EposError> {
        self.control(node_id, GOTO_VELOCITY_CMD)
    }

    pub fn set_mode(&self, node_id: u8, mode: Mode) -> Result<(), EposError> {
        self.write_object(MODES_OPERATION_INDEX, 0, node_id, mode as u8 as u32)
    }

    /// Velocity mode set point
    pub fn set_velocity(&self, node_id: u8, value: i32) -> Result<(), EposError> {
        self.write_object(VELOCITY_MODE_SP_INDEX, 0, node_id, value as u32)
    }

    /// Position mode set point
    pub fn set_position(&self, node_id: u8, value: i32) -> Result<(), EposError> {
        self.write_object(POSITION_MODE_SP_INDEX, 0, node_id, value as u32)
    }

    pub fn set_target_velocity(&self, node_id: u8, value: i32) -> Result<(), EposError> {
        self.write_object(TARGET_VELOCITY_INDEX, 0, node_id, value as u32)
    }

    pub fn set_target_position(&self, node_id: u8, value: i32) -> Result<(), EposError> {
        self.write_object(TARGET_POSITION_INDEX, 0, node_id, value as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes() {
        for code in 0u8..=0xFF {
            if let Some(mode) = Mode::from_u8(code) {
                assert_eq!(mode as u8, code);
            }
        }
        assert_eq!(Mode::from_u8(0xFE), Some(Mode::Velocity));
        assert_eq!(Mode::from_u8(0x00), None);
    }
}
