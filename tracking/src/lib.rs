extern crate adskalman;
extern crate nalgebra as na;
extern crate num_traits;

pub mod motion_model_2d;
pub mod observation_model_2d;

pub use motion_model_2d::{ConstantVelocity2DModel, MotionModel2DFixedDt};
pub use observation_model_2d::ObservationModel2D;
