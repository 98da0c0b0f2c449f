// Media detection — magic bytes and extensions for posters, audio tags and HTTP content types.

pub mod media;
