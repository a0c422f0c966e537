pub mod spill;
