use std::io::Cursor;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::SinkResult, frame::Frame};

/// Hidden execution inputs embedded into every written PNG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub prompt: Option<Value>,
    #[serde(default)]
    pub extra_pnginfo: Option<Map<String, Value>>,
}

impl ExecutionContext {
    /// Text chunks in write order: `prompt` first, then every extra key as JSON.
    pub fn text_chunks(&self) -> Vec<(String, String)> {
        let mut chunks = Vec::new();
        if let Some(prompt) = &self.prompt {
            chunks.push(("prompt".to_string(), prompt.to_string()));
        }
        if let Some(extra) = &self.extra_pnginfo {
            for (key, value) in extra {
                chunks.push((key.clone(), value.to_string()));
            }
        }
        chunks
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PngWriter { compress_level: u8 }

impl PngWriter {
    pub fn new(compress_level: u8) -> Self { Self { compress_level: compress_level.min(9) } }

    fn compression(&self) -> png::Compression {
        match self.compress_level {
            0..=3 => png::Compression::Fast,
            4..=6 => png::Compression::Default,
            _ => png::Compression::Best,
        }
    }

    /// Encode a frame as 8-bit PNG with the context's text chunks.
    pub fn encode(&self, frame: &Frame, ctx: &ExecutionContext) -> SinkResult<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut enc = png::Encoder::new(&mut out, frame.width(), frame.height());
            enc.set_color(if frame.channels() == 4 { png::ColorType::Rgba } else { png::ColorType::Rgb });
            enc.set_depth(png::BitDepth::Eight);
            enc.set_compression(self.compression());
            for (keyword, text) in ctx.text_chunks() {
                // tEXt is latin-1 only
                if text.is_ascii() {
                    enc.add_text_chunk(keyword, text)?;
                } else {
                    enc.add_itxt_chunk(keyword, text)?;
                }
            }
            let mut writer = enc.write_header()?;
            writer.write_image_data(&frame.to_u8())?;
            writer.finish()?;
        }
        Ok(out)
    }
}

/// Width and height from a PNG header, if the bytes decode as one.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let reader = png::Decoder::new(Cursor::new(bytes)).read_info().ok()?;
    let info = reader.info();
    Some((info.width, info.height))
}
