pub mod td;
