use crate::error::Result;
use crate::gpu::{Command, CommandList, ImageDesc, ImageFormat, ImageHandle, ResourceState, RtDevice};

pub const OUTPUT_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;

/// Storage image written by one frame's trace dispatch.
///
/// Tracks the state the recorded command stream leaves it in, so transitions
/// only emit a barrier when the state actually changes.
#[derive(Debug)]
pub struct OutputImage {
    image: ImageHandle,
    width: u32,
    height: u32,
    format: ImageFormat,
    state: ResourceState,
}

impl OutputImage {
    pub fn new<D: RtDevice>(device: &mut D, width: u32, height: u32, name: &str) -> Result<Self> {
        let image = device.create_image(&ImageDesc {
            width,
            height,
            format: OUTPUT_FORMAT,
            name,
        })?;
        Ok(OutputImage {
            image,
            width,
            height,
            format: OUTPUT_FORMAT,
            state: ResourceState::Common,
        })
    }

    /// Records a barrier to `to` unless the image is already there.
    pub fn transition(&mut self, cmd: &mut CommandList, to: ResourceState) {
        if self.state == to {
            return;
        }
        cmd.push(Command::ImageBarrier {
            image: self.image,
            before: self.state,
            after: to,
        });
        self.state = to;
    }

    pub fn image(&self) -> ImageHandle {
        self.image
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }
}
