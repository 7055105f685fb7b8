mod pose_guider;
mod reference_encoder;

pub use pose_guider::PoseGuider;
pub use reference_encoder::ReferenceEncoder;
