mod operations;
mod recovery;
mod sync;
