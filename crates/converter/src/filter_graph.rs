//! Filter graph construction for sticker shaping.
//!
//! Graphs are built append-only through [`GraphBuilder`] and checked for
//! label closure when finished: every link read by a node is a real input
//! stream or was produced by an earlier node and not read since, nothing is
//! left unread, and the only unlabeled output is the last node.

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use crate::ffprobe::VideoStream;
use crate::job::FrameShape;
use crate::policy::Dimensions;

/// Sources with both edges under this are upsampled before padding
pub const SMALL_SOURCE_EDGE: u32 = 150;

/// Named link between filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// Video of the n-th ffmpeg input
    Input(u8),
    Sticker,
    Mask,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Input(n) => write!(f, "{}:v", n),
            Link::Sticker => f.write_str("sticker"),
            Link::Mask => f.write_str("mask"),
            Link::TopLeft => f.write_str("tl"),
            Link::TopRight => f.write_str("tr"),
            Link::BottomLeft => f.write_str("bl"),
            Link::BottomRight => f.write_str("br"),
        }
    }
}

/// How a scale fits the requested box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fit {
    /// Fit inside, keeping aspect
    Decrease,
    /// Cover the box, keeping aspect
    Increase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Clockwise,
    Half,
    CounterClockwise,
}

/// Primitive image operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Null,
    Scale {
        width: u32,
        height: u32,
        fit: Fit,
        nearest: bool,
    },
    Pad {
        width: u32,
        height: u32,
        color: String,
    },
    Crop {
        width: u32,
        height: u32,
    },
    /// Solid color source
    Color {
        color: String,
    },
    /// Resize the first input to the second input's size, or to expressions over it
    ScaleToRef {
        size: Option<(String, String)>,
    },
    Split(usize),
    Rotate(Rotation),
    /// Overlay the second input on the first; stops with the shorter one
    Overlay {
        x: String,
        y: String,
    },
    /// Color from the first input, alpha from the second input's luma
    AlphaMerge,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Null => "null",
            Operation::Scale { .. } => "scale",
            Operation::Pad { .. } => "pad",
            Operation::Crop { .. } => "crop",
            Operation::Color { .. } => "color",
            Operation::ScaleToRef { .. } => "scale2ref",
            Operation::Split(_) => "split",
            Operation::Rotate(_) => "transpose",
            Operation::Overlay { .. } => "overlay",
            Operation::AlphaMerge => "alphamerge",
        }
    }

    /// ffmpeg filter text, name and options
    pub fn render(&self) -> String {
        match self {
            Operation::Null | Operation::AlphaMerge => self.name().to_string(),
            Operation::Scale { width, height, fit, nearest } => {
                let fit = match fit {
                    Fit::Decrease => "decrease",
                    Fit::Increase => "increase",
                };
                let mut s = format!("scale=w={}:h={}:force_original_aspect_ratio={}", width, height, fit);
                if *nearest {
                    s.push_str(":flags=neighbor");
                }
                s
            }
            Operation::Pad { width, height, color } => {
                // -1 centers the input on that axis
                format!("pad=w={}:h={}:x=-1:y=-1:color={}", width, height, color)
            }
            Operation::Crop { width, height } => format!("crop=w={}:h={}", width, height),
            Operation::Color { color } => format!("color=color={}", color),
            Operation::ScaleToRef { size: None } => self.name().to_string(),
            Operation::ScaleToRef { size: Some((w, h)) } => format!("scale2ref=w='{}':h='{}'", w, h),
            Operation::Split(n) => format!("split={}", n),
            Operation::Rotate(rotation) => {
                let dir = match rotation {
                    Rotation::Clockwise => "clock",
                    // Corner templates are symmetric about their diagonal, so the
                    // transposed clockwise turn lands exactly on the 180° tile
                    Rotation::Half => "clock_flip",
                    Rotation::CounterClockwise => "cclock",
                };
                format!("transpose=dir={}", dir)
            }
            Operation::Overlay { x, y } => format!("overlay=x={}:y={}:shortest=1", x, y),
        }
    }
}

/// One filter with its links
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterNode {
    pub operation: Operation,
    pub inputs: Vec<Link>,
    pub outputs: Vec<Link>,
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for link in &self.inputs {
            write!(f, "[{}]", link)?;
        }
        f.write_str(&self.operation.render())?;
        for link in &self.outputs {
            write!(f, "[{}]", link)?;
        }
        Ok(())
    }
}

/// Label closure violations found when finishing a graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {node} ({op}) reads [{link}] which no earlier node produced")]
    UnknownLink { node: usize, op: &'static str, link: String },

    #[error("node {node} ({op}) reads input stream [{link}] a second time")]
    InputReused { node: usize, op: &'static str, link: String },

    #[error("node {node} ({op}) produces [{link}] while an earlier [{link}] is still unread")]
    DuplicateLink { node: usize, op: &'static str, link: String },

    #[error("node {node} ({op}) has no outputs but is not the last node")]
    EarlySink { node: usize, op: &'static str },

    #[error("[{0}] is produced but never read")]
    DanglingLink(String),

    #[error("graph does not end in an unlabeled output")]
    MissingSink,
}

/// Validated, immutable filter graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterGraph {
    nodes: Vec<FilterNode>,
}

impl FilterGraph {
    pub fn nodes(&self) -> &[FilterNode] {
        &self.nodes
    }

    /// Whether any node reads the n-th ffmpeg input
    pub fn reads_input(&self, n: u8) -> bool {
        self.nodes.iter().any(|node| node.inputs.contains(&Link::Input(n)))
    }

    /// Argument for `-filter_complex`
    pub fn to_filter_complex(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_filter_complex())
    }
}

/// Append-only graph builder
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<FilterNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; an empty `outputs` marks the graph's output
    pub fn node(&mut self, operation: Operation, inputs: &[Link], outputs: &[Link]) -> &mut Self {
        self.nodes.push(FilterNode {
            operation,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        self
    }

    /// Check label closure and freeze the graph
    pub fn finish(self) -> Result<FilterGraph, GraphError> {
        let last = self.nodes.len().checked_sub(1).ok_or(GraphError::MissingSink)?;
        let mut unread: Vec<Link> = Vec::new();
        let mut used_inputs: HashSet<u8> = HashSet::new();

        for (i, node) in self.nodes.iter().enumerate() {
            let op = node.operation.name();

            for link in &node.inputs {
                match link {
                    Link::Input(n) => {
                        if !used_inputs.insert(*n) {
                            return Err(GraphError::InputReused { node: i, op, link: link.to_string() });
                        }
                    }
                    _ => match unread.iter().position(|l| l == link) {
                        Some(pos) => {
                            unread.remove(pos);
                        }
                        None => {
                            return Err(GraphError::UnknownLink { node: i, op, link: link.to_string() });
                        }
                    },
                }
            }

            if node.outputs.is_empty() && i != last {
                return Err(GraphError::EarlySink { node: i, op });
            }

            for link in &node.outputs {
                if unread.contains(link) {
                    return Err(GraphError::DuplicateLink { node: i, op, link: link.to_string() });
                }
                unread.push(*link);
            }
        }

        if !self.nodes[last].outputs.is_empty() {
            return Err(GraphError::MissingSink);
        }
        if let Some(link) = unread.first() {
            return Err(GraphError::DanglingLink(link.to_string()));
        }

        Ok(FilterGraph { nodes: self.nodes })
    }
}

/// Requested look of the sticker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Presentation {
    pub shape: FrameShape,
    pub force_crop: bool,
    pub is_emoji: bool,
}

/// Grayscale template fed as the second ffmpeg input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskTemplate {
    Circle,
    /// Top-left corner tile; the shape picks the curvature
    Corner(FrameShape),
}

impl MaskTemplate {
    pub fn file_name(&self) -> &'static str {
        match self {
            MaskTemplate::Circle => "circle.png",
            MaskTemplate::Corner(FrameShape::Medium) => "corner_medium.png",
            MaskTemplate::Corner(FrameShape::Lite) => "corner_lite.png",
            MaskTemplate::Corner(_) => "corner.png",
        }
    }
}

/// Which branch the builder took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Treatment {
    /// Small alpha-native source centered on a transparent canvas
    AlphaPadded,
    /// Masked with a template
    Shaped(MaskTemplate),
    /// Plain fit (optionally cropped) to the canvas
    Scaled,
}

/// Graph plus the decision that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickerGraph {
    pub graph: FilterGraph,
    pub treatment: Treatment,
}

impl StickerGraph {
    pub fn mask_template(&self) -> Option<MaskTemplate> {
        match self.treatment {
            Treatment::Shaped(template) => Some(template),
            _ => None,
        }
    }
}

/// Build the shaping graph for a source and presentation
pub fn build_sticker_graph(source: &VideoStream, presentation: &Presentation) -> Result<StickerGraph, GraphError> {
    let canvas = Dimensions::for_variant(presentation.is_emoji);
    let alpha_native = source.is_alpha_native();

    let mut b = GraphBuilder::new();
    b.node(Operation::Null, &[Link::Input(0)], &[Link::Sticker]);

    let needs_padding = alpha_native
        && !presentation.is_emoji
        && source.width < Dimensions::STANDARD.width
        && source.height < Dimensions::STANDARD.height;

    if needs_padding {
        let mut height = source.height;
        if source.width < SMALL_SOURCE_EDGE && source.height < SMALL_SOURCE_EDGE {
            height = SMALL_SOURCE_EDGE;
            b.node(
                Operation::Scale {
                    width: SMALL_SOURCE_EDGE,
                    height: SMALL_SOURCE_EDGE,
                    fit: Fit::Decrease,
                    nearest: true,
                },
                &[Link::Sticker],
                &[Link::Sticker],
            );
        }
        b.node(
            Operation::Pad {
                width: Dimensions::STANDARD.width,
                height,
                color: "black@0".to_string(),
            },
            &[Link::Sticker],
            &[],
        );
        return Ok(StickerGraph {
            graph: b.finish()?,
            treatment: Treatment::AlphaPadded,
        });
    }

    // Native alpha keeps its own transparency
    if presentation.shape.is_shaped() && !alpha_native {
        let template = match presentation.shape {
            FrameShape::Circle => {
                fill_and_crop(&mut b, canvas);
                b.node(
                    Operation::ScaleToRef { size: None },
                    &[Link::Input(1), Link::Sticker],
                    &[Link::Mask, Link::Sticker],
                );
                MaskTemplate::Circle
            }
            shape => {
                if presentation.force_crop {
                    fill_and_crop(&mut b, canvas);
                } else {
                    b.node(fit_scale(canvas), &[Link::Sticker], &[Link::Sticker]);
                }
                rounded_corner_mask(&mut b);
                MaskTemplate::Corner(shape)
            }
        };
        b.node(Operation::AlphaMerge, &[Link::Sticker, Link::Mask], &[]);
        return Ok(StickerGraph {
            graph: b.finish()?,
            treatment: Treatment::Shaped(template),
        });
    }

    if presentation.force_crop {
        fill_and_crop(&mut b, canvas);
    }
    b.node(fit_scale(canvas), &[Link::Sticker], &[]);
    Ok(StickerGraph {
        graph: b.finish()?,
        treatment: Treatment::Scaled,
    })
}

fn fit_scale(canvas: Dimensions) -> Operation {
    Operation::Scale {
        width: canvas.width,
        height: canvas.height,
        fit: Fit::Decrease,
        nearest: false,
    }
}

/// Cover the canvas, then cut it out of the center
fn fill_and_crop(b: &mut GraphBuilder, canvas: Dimensions) {
    b.node(
        Operation::Scale {
            width: canvas.width,
            height: canvas.height,
            fit: Fit::Increase,
            nearest: false,
        },
        &[Link::Sticker],
        &[Link::Sticker],
    );
    b.node(
        Operation::Crop {
            width: canvas.width,
            height: canvas.height,
        },
        &[Link::Sticker],
        &[Link::Sticker],
    );
}

/// White mask the size of the sticker with the corner tile stamped into each corner
fn rounded_corner_mask(b: &mut GraphBuilder) {
    b.node(
        Operation::Color { color: "white".to_string() },
        &[],
        &[Link::Mask],
    );
    b.node(
        Operation::ScaleToRef { size: None },
        &[Link::Mask, Link::Sticker],
        &[Link::Mask, Link::Sticker],
    );
    // Square tile, half of the mask's short edge
    b.node(
        Operation::ScaleToRef {
            size: Some((
                "if(gte(main_w,main_h),main_h/2,main_w/2)".to_string(),
                "ow".to_string(),
            )),
        },
        &[Link::Input(1), Link::Mask],
        &[Link::TopLeft, Link::Mask],
    );
    b.node(
        Operation::Split(4),
        &[Link::TopLeft],
        &[Link::TopLeft, Link::TopRight, Link::BottomLeft, Link::BottomRight],
    );
    b.node(Operation::Rotate(Rotation::Clockwise), &[Link::TopRight], &[Link::TopRight]);
    b.node(Operation::Rotate(Rotation::Half), &[Link::BottomRight], &[Link::BottomRight]);
    b.node(Operation::Rotate(Rotation::CounterClockwise), &[Link::BottomLeft], &[Link::BottomLeft]);

    for (tile, x, y) in [
        (Link::TopLeft, "0", "0"),
        (Link::TopRight, "W-w+1", "0"),
        (Link::BottomLeft, "0", "H-h+1"),
        (Link::BottomRight, "W-w+1", "H-h+1"),
    ] {
        b.node(
            Operation::Overlay { x: x.to_string(), y: y.to_string() },
            &[Link::Mask, tile],
            &[Link::Mask],
        );
    }
}
