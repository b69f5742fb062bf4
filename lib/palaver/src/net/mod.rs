//! Wire framing and descriptor I/O shared between the workers and the
//! dispatch runtime.

pub mod codec;
pub mod frame;
pub mod serializer;
