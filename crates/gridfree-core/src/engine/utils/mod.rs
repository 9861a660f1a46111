pub mod simplex;
