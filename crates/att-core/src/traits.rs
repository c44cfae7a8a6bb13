//! Core traits shared between the engine and whatever persistence layer owns
//! the records.

/// Primary key type assigned by the persistence layer
pub type Id = i64;

/// Trait for records that have a primary key
pub trait Identifiable {
    fn id(&self) -> Option<Id>;

    fn is_persisted(&self) -> bool {
        self.id().is_some()
    }

    fn is_new_record(&self) -> bool {
        !self.is_persisted()
    }
}
