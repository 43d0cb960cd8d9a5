use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("payload has {owners} owners, expected exactly one")]
pub struct OwnershipViolation {
    pub owners: usize,
}

// Takes sole ownership of a payload that is not safe for concurrent access,
// so it can be handed wholesale to another execution context. Adoption is
// checked, not assumed: the payload must have exactly one owner at the
// moment the box is built.
#[derive(Debug, PartialEq, Eq)]
pub struct ExclusiveTransferBox<T> {
    payload: T,
}

impl<T> ExclusiveTransferBox<T> {

    pub fn new(payload: Arc<T>) -> Result<Self, OwnershipViolation> {
        let owners = Arc::strong_count(&payload);
        match Arc::try_unwrap(payload) {
            Ok(payload) => Ok(ExclusiveTransferBox { payload }),
            Err(_) => Err(OwnershipViolation { owners }),
        }
    }

    // Valid only for the current holder; moving the box moves the payload
    // with it and nothing shared stays behind.
    pub fn get(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sole_owner_adopted() {
        let payload = Arc::new(vec![1u8, 2, 3]);
        let mut boxed = ExclusiveTransferBox::new(payload).unwrap();
        boxed.get().push(4);
        assert_eq!(boxed.into_inner(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_shared_payload_rejected() {
        let payload = Arc::new(vec![1u8, 2, 3]);
        let retained = payload.clone();
        let err = ExclusiveTransferBox::new(payload).unwrap_err();
        assert_eq!(err, OwnershipViolation { owners: 2 });
        // The retained reference is still the only way at the data.
        assert_eq!(*retained, vec![1, 2, 3]);
    }

    #[test]
    fn test_moves_across_threads() {
        let boxed = ExclusiveTransferBox::new(Arc::new(String::from("body"))).unwrap();
        let handle = std::thread::spawn(move || {
            let mut boxed = boxed;
            boxed.get().push_str(" bytes");
            boxed.into_inner()
        });
        assert_eq!(handle.join().unwrap(), "body bytes");
    }
}
