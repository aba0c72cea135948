mod heap;
mod quickjs;

pub use quickjs::{QuickJsContext, QuickJsEngine};
