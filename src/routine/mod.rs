//! Routines: their definition, condition evaluation, the device registry and
//! the execution engine.

pub mod condition;
pub mod engine;
pub mod lab;
pub mod model;

pub use condition::{check, evaluate, SampleSource};
pub use engine::{RoutineHandle, RoutineRunner, SlotExit, SlotReport};
pub use lab::{Hardware, Lab};
pub use model::{
    Algorithm, CaptureSettings, Comparator, Interaction, LightMode, Parameter, ParameterCondition, Routine,
    RoutineSlot, Setting, SettingPayload, Subroutine,
};
