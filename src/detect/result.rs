use crate::frame::Roi;

/// Detected plate region in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlateBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl PlateBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32, class_id: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            class_id,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    fn intersection_area(&self, other: &PlateBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        (right - left).max(0.0) * (bottom - top).max(0.0)
    }

    pub fn iou(&self, other: &PlateBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Integer crop rectangle clamped to a `frame_width` x `frame_height`
    /// frame. `None` when nothing of the box lies inside the frame.
    pub fn crop_rect(&self, frame_width: u32, frame_height: u32) -> Option<Roi> {
        if !(self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite())
        {
            return None;
        }
        let left = self.x.floor().max(0.0).min(frame_width as f32) as u32;
        let top = self.y.floor().max(0.0).min(frame_height as f32) as u32;
        let right = (self.x + self.width).ceil().max(0.0).min(frame_width as f32) as u32;
        let bottom = (self.y + self.height).ceil().max(0.0).min(frame_height as f32) as u32;
        if right <= left || bottom <= top {
            return None;
        }
        Some(Roi::new(left, top, right - left, bottom - top))
    }
}

/// Greedy non-maximum suppression. Keeps boxes in descending confidence and
/// drops any box overlapping an already kept one by more than `iou_threshold`.
pub fn non_max_suppression(boxes: &mut Vec<PlateBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept = 0;
    for index in 0..boxes.len() {
        let overlaps = (0..kept).any(|prev| boxes[prev].iou(&boxes[index]) > iou_threshold);
        if !overlaps {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_rect_is_clamped() {
        let plate = PlateBox::new(-5.5, 10.2, 50.0, 20.0, 0.9, 0);
        assert_eq!(plate.crop_rect(40, 25), Some(Roi::new(0, 10, 40, 15)));
        let outside = PlateBox::new(100.0, 100.0, 10.0, 10.0, 0.9, 0);
        assert_eq!(outside.crop_rect(40, 25), None);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = PlateBox::new(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = PlateBox::new(20.0, 20.0, 10.0, 10.0, 0.8, 0);
        assert_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_keeps_best_of_overlapping() {
        let mut boxes = vec![
            PlateBox::new(0.0, 0.0, 10.0, 10.0, 0.6, 0),
            PlateBox::new(1.0, 1.0, 10.0, 10.0, 0.9, 0),
            PlateBox::new(50.0, 50.0, 10.0, 10.0, 0.7, 0),
        ];
        non_max_suppression(&mut boxes, 0.45);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].confidence, 0.9);
        assert_eq!(boxes[1].confidence, 0.7);
    }
}
