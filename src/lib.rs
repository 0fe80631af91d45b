// Copyright (c)  by Gleb E. Zaslavkiy
//MIT License
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
pub mod LM_optimization;
pub mod dataset;
pub mod fitting;
pub mod problem_LM;
pub mod qr_LM;
pub mod trust_region_LM;
pub mod utils;
