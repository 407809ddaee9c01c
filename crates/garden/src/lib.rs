mod container;
mod process;

pub use container::{Container, GraceTime};
pub use process::{BoxedReader, BoxedWriter, ProcessIo, ProcessSpec, Signal, TtySpec, WindowSize};
