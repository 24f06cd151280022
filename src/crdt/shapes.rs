//! Last-writer-wins shape collection backing whiteboards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{CrdtError, CrdtResult, Intent, Lww, OpId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Arrow,
    Freehand,
    Text,
}

/// A whiteboard shape. Writes replace the whole shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub stroke: String,
    pub fill: Option<String>,
    pub stroke_width: f64,
    /// Path points for lines, arrows and freehand strokes
    pub points: Vec<(f64, f64)>,
    pub text: Option<String>,
    pub z_index: i64,
}

impl Shape {
    pub fn new(kind: ShapeKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            stroke: "#1f2937".to_string(),
            fill: None,
            stroke_width: 2.0,
            points: Vec::new(),
            text: None,
            z_index: 0,
        }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_stroke(mut self, stroke: impl Into<String>, width: f64) -> Self {
        self.stroke = stroke.into();
        self.stroke_width = width;
        self
    }

    pub fn with_points(mut self, points: Vec<(f64, f64)>) -> Self {
        self.points = points;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    fn validate(&self) -> CrdtResult<()> {
        let scalars = [
            self.x,
            self.y,
            self.width,
            self.height,
            self.rotation,
            self.stroke_width,
        ];
        let finite = scalars.iter().all(|v| v.is_finite())
            && self
                .points
                .iter()
                .all(|(px, py)| px.is_finite() && py.is_finite());
        if !finite {
            return Err(CrdtError::Validation(
                "shape coordinates must be finite".into(),
            ));
        }
        if self.width < 0.0 || self.height < 0.0 || self.stroke_width < 0.0 {
            return Err(CrdtError::Validation("shape size must not be negative".into()));
        }
        Ok(())
    }
}

/// Shape replica operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeOp {
    Put { id: String, shape: Shape },
    Remove { id: String },
}

/// What a local shape write replaced
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeRevert {
    pub id: String,
    pub previous: Option<Shape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeView {
    pub id: String,
    #[serde(flatten)]
    pub shape: Shape,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeSetReplica {
    entries: HashMap<String, Lww<Option<Shape>>>,
}

impl ShapeSetReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shapes currently on the board
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.entries.get(id).and_then(|e| e.value.as_ref())
    }

    /// Shapes in paint order
    pub fn shapes(&self) -> Vec<ShapeView> {
        let mut shapes: Vec<ShapeView> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                entry.value.as_ref().map(|shape| ShapeView {
                    id: id.clone(),
                    shape: shape.clone(),
                })
            })
            .collect();
        shapes.sort_by(|a, b| {
            a.shape
                .z_index
                .cmp(&b.shape.z_index)
                .then_with(|| a.id.cmp(&b.id))
        });
        shapes
    }

    pub(crate) fn prepare(&self, intent: &Intent) -> CrdtResult<ShapeOp> {
        match intent {
            Intent::PutShape { id, shape } => {
                if id.trim().is_empty() {
                    return Err(CrdtError::Validation("shape id must not be empty".into()));
                }
                shape.validate()?;
                Ok(ShapeOp::Put {
                    id: id.clone(),
                    shape: shape.clone(),
                })
            }
            Intent::RemoveShape { id } => {
                if self.get(id).is_none() {
                    return Err(CrdtError::InvalidOperation(format!(
                        "shape not found: {}",
                        id
                    )));
                }
                Ok(ShapeOp::Remove { id: id.clone() })
            }
            other => Err(CrdtError::InvalidOperation(format!(
                "{:?} intent cannot target a shape replica",
                other.kind()
            ))),
        }
    }

    pub(crate) fn apply(&mut self, op_id: &OpId, op: &ShapeOp) -> Option<ShapeRevert> {
        let (id, value) = match op {
            ShapeOp::Put { id, shape } => (id, Some(shape.clone())),
            ShapeOp::Remove { id } => (id, None),
        };
        match self.entries.get_mut(id) {
            Some(entry) => entry.set(value, op_id).map(|previous| ShapeRevert {
                id: id.clone(),
                previous,
            }),
            None => {
                self.entries
                    .insert(id.clone(), Lww::new(value, op_id.clone()));
                Some(ShapeRevert {
                    id: id.clone(),
                    previous: None,
                })
            }
        }
    }

    /// Restore what a local write replaced, unless someone wrote the shape since
    pub(crate) fn revert_intents(&self, op_id: &OpId, revert: &ShapeRevert) -> Vec<Intent> {
        let Some(entry) = self.entries.get(&revert.id) else {
            return Vec::new();
        };
        if entry.stamp != *op_id {
            return Vec::new();
        }
        match (&revert.previous, &entry.value) {
            (Some(previous), _) => vec![Intent::PutShape {
                id: revert.id.clone(),
                shape: previous.clone(),
            }],
            (None, Some(_)) => vec![Intent::RemoveShape {
                id: revert.id.clone(),
            }],
            (None, None) => Vec::new(),
        }
    }

    pub(crate) fn clear_intents(&self) -> Vec<Intent> {
        self.shapes()
            .into_iter()
            .map(|view| Intent::RemoveShape { id: view.id })
            .collect()
    }
}
