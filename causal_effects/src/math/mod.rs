pub mod logit;
pub mod moments;
pub mod ols;
