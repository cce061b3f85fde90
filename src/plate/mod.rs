pub mod chars;
pub mod rectify;
pub mod taxonomy;

pub use chars::{CharacterCandidate, CharacterDetection, SizeClass, CHAR_NAMES};
pub use rectify::{PlateCandidate, CROP_HEIGHT, CROP_WIDTH};
pub use taxonomy::{ParsedPlate, PlateKind};
