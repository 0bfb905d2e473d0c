//! Architecture-specific definitions. Only the x86-64 guest architecture is in scope (§1).

pub mod x86_64;
