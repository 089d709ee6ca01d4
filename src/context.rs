//! Type-erased per-connection context slot: application code attaches
//! arbitrary state to a `TcpConnection` and reads it back in later
//! callbacks without threading a generic parameter through `TcpServer`/
//! `TcpClient`. Grounded on annety's `containers/Any.h`.

use std::any::Any;

#[derive(Default)]
pub struct Context(Option<Box<dyn Any + Send>>);

impl Context {
    pub fn new() -> Self {
        Context(None)
    }

    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|b| b.downcast_mut())
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_typed_value() {
        let mut ctx = Context::new();
        assert!(!ctx.is_set());
        ctx.set(42u32);
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert_eq!(ctx.get::<String>(), None);
    }
}
