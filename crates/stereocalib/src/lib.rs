#![doc = include_str!(concat!("../", env!("CARGO_PKG_README")))]

#[doc(inline)]
pub use stereocalib_image as image;

#[doc(inline)]
pub use stereocalib_imgproc as imgproc;

#[doc(inline)]
pub use stereocalib_optim as optim;

#[doc(inline)]
pub use stereocalib_3d as k3d;

#[doc(inline)]
pub use stereocalib_calib as calib;
