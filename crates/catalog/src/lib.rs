//! Catalog domain module (event-sourced).
//!
//! Books with localized title and description, reader likes and soft-delete.
//! Pure deterministic domain logic (no IO, no storage).

pub mod book;

pub use book::{
    Book, BookCommand, BookCreated, BookDeleted, BookEvent, BookId, BookLiked, BookRestored,
    BookRevised, BookUnliked, CreateBook, DeleteBook, LikeBook, RestoreBook, ReviseBook,
    UnlikeBook,
};
